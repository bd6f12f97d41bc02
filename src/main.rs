//! Command-line driver: compile a rule file into a serialized automaton.
//!
//! Each non-blank, non-comment line of the input names one rule:
//!
//! ```text
//! allow 0x4 0x0 /home/*/.config/**
//! deny  0x2 0x2 /etc/shadow
//! ```
//!
//! The fields are verb (`allow` or `deny`), permission mask, audit mask
//! and the glob pattern.  Diagnostics selected with the dump switches go
//! through `env_logger`, so run with `RUST_LOG=debug` to see them.

use std::fs;
use std::io::{self, Read, Write};
use std::process;

use policy_dfa::{DfaFlags, Ruleset};

struct Options {
    flags: DfaFlags,
    dot: bool,
    dump: bool,
    output: Option<String>,
    input: Option<String>,
}

fn usage() -> ! {
    eprintln!(
        "usage: policy-dfa [OPTIONS] [RULES]\n\
         \n\
         Compile a rule file (or stdin) into a serialized match blob.\n\
         \n\
           -o FILE        write the blob to FILE\n\
           --dot          print the minimized automaton as graphviz dot\n\
           --dump         print the minimized automaton as text\n\
           --hash-perms   split the initial minimize partition by accept masks\n\
           --hash-trans   split the initial minimize partition by transition shape\n\
           --progress     log progress lines (needs RUST_LOG=debug)\n\
           --stats        log per-stage statistics\n\
           --rule-expr    log each rule's translated regex\n\
           --equiv-stats  log the byte-class count"
    );
    process::exit(2);
}

fn parse_args() -> Options {
    let mut opts = Options {
        flags: DfaFlags::empty(),
        dot: false,
        dump: false,
        output: None,
        input: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-o" => match args.next() {
                Some(path) => opts.output = Some(path),
                None => usage(),
            },
            "--dot" => opts.dot = true,
            "--dump" => opts.dump = true,
            "--hash-perms" => opts.flags |= DfaFlags::CONTROL_MINIMIZE_HASH_PERMS,
            "--hash-trans" => opts.flags |= DfaFlags::CONTROL_MINIMIZE_HASH_TRANS,
            "--progress" => opts.flags |= DfaFlags::DUMP_PROGRESS,
            "--stats" => opts.flags |= DfaFlags::DUMP_STATS,
            "--rule-expr" => opts.flags |= DfaFlags::DUMP_RULE_EXPR,
            "--equiv-stats" => opts.flags |= DfaFlags::DUMP_EQUIV_STATS,
            "-h" | "--help" => usage(),
            _ if arg.starts_with('-') => usage(),
            _ if opts.input.is_none() => opts.input = Some(arg),
            _ => usage(),
        }
    }
    opts
}

fn parse_mask(field: &str) -> Result<u32, String> {
    let parsed = match field.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => field.parse(),
    };
    parsed.map_err(|_| format!("bad permission mask '{}'", field))
}

fn parse_rule_fields(line: &str) -> Result<(bool, u32, u32, String), String> {
    let mut fields = line.split_whitespace();
    let verb = fields.next().ok_or("missing verb")?;
    let deny = match verb {
        "allow" => false,
        "deny" => true,
        other => return Err(format!("unknown verb '{}'", other)),
    };
    let perms = parse_mask(fields.next().ok_or("missing permission mask")?)?;
    let audit = parse_mask(fields.next().ok_or("missing audit mask")?)?;
    let pattern = fields.next().ok_or("missing pattern")?.to_string();
    if fields.next().is_some() {
        return Err("trailing fields after pattern".to_string());
    }
    Ok((deny, perms, audit, pattern))
}

/// Parse one rule line into `(deny, perms, audit, pattern)`.  Blank lines
/// and `#` comments yield `None`.
fn parse_rule_line(line: &str) -> Option<Result<(bool, u32, u32, String), String>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(parse_rule_fields(line))
}

fn run(opts: &Options) -> Result<(), String> {
    let text = match &opts.input {
        Some(path) => {
            fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path, e))?
        }
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("cannot read stdin: {}", e))?;
            buf
        }
    };

    let mut rs = Ruleset::new();
    for (lineno, line) in text.lines().enumerate() {
        let Some(parsed) = parse_rule_line(line) else {
            continue;
        };
        let (deny, perms, audit, pattern) =
            parsed.map_err(|e| format!("line {}: {}", lineno + 1, e))?;
        rs.add_rule(pattern.as_bytes(), deny, perms, audit)
            .map_err(|e| format!("line {}: {}", lineno + 1, e))?;
    }

    if opts.dot || opts.dump {
        let dfa = rs.compile(opts.flags).map_err(|e| e.to_string())?;
        let stdout = io::stdout();
        if opts.dot {
            dfa.to_dot(stdout.lock());
        }
        if opts.dump {
            dfa.dump(stdout.lock());
        }
        return Ok(());
    }

    let blob = rs.create_dfa(opts.flags).map_err(|e| e.to_string())?;
    match &opts.output {
        Some(path) => {
            fs::write(path, &blob).map_err(|e| format!("cannot write {}: {}", path, e))?;
        }
        None => {
            writeln!(io::stdout(), "{} rules -> {} byte blob", rs.len(), blob.len())
                .map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let opts = parse_args();
    if let Err(msg) = run(&opts) {
        eprintln!("policy-dfa: {}", msg);
        process::exit(1);
    }
}
