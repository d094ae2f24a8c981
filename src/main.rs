use anyhow::{bail, Context, Result};
use clap::{App, Arg};

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, BufRead};
use std::process;

mod regs;
mod trace;

use regs::Reg;
use trace::{RegionPass, Tracer};

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("output-format")
                .help("The output format to use")
                .short("F")
                .long("format")
                .takes_value(true)
                .possible_values(&["text", "json"])
                .default_value("text"),
        )
        .arg(
            Arg::with_name("begin-addr")
                .help("Virtual address (hex) of the region's first instruction")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("end-addr")
                .help("Virtual address (hex) of the region's last instruction")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::with_name("tracee-name")
                .help("The program to profile")
                .required(true)
                .index(3),
        )
        .arg(
            Arg::with_name("tracee-args")
                .help("The command-line arguments to execute the tracee with")
                .raw(true),
        )
}

fn parse_addr(raw: &str) -> Result<u64> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .with_context(|| format!("malformed address: {}", raw))
}

fn next_token(input: &mut impl BufRead, pending: &mut VecDeque<String>) -> Result<String> {
    loop {
        if let Some(token) = pending.pop_front() {
            return Ok(token);
        }

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            bail!("input ended before the `run profile` sentinel");
        }
        pending.extend(line.split_whitespace().map(String::from));
    }
}

/// Reads the `<variable> <register>` prompt pairs, then resolves each
/// register spelling.
///
/// Input ends at the sentinel pair `run profile`, and only at that exact
/// pair: `run rax` binds a variable named `run` like any other (which the
/// final erase of `run` then drops). A rebound variable keeps its latest
/// register.
fn read_var_map(input: &mut impl BufRead) -> Result<BTreeMap<String, Reg>> {
    let mut pairs: BTreeMap<String, String> = BTreeMap::new();
    let mut pending = VecDeque::new();

    loop {
        let variable = next_token(input, &mut pending)?;
        let register = next_token(input, &mut pending)?;

        let done = variable == "run" && register == "profile";
        if pairs.insert(variable.clone(), register).is_some() && !done {
            log::warn!("variable {} rebound; keeping the latest register", variable);
        }
        if done {
            break;
        }
    }
    pairs.remove("run");

    pairs
        .into_iter()
        .map(|(variable, register)| {
            let register = register
                .parse::<Reg>()
                .with_context(|| format!("variable {}", variable))?;
            Ok((variable, register))
        })
        .collect()
}

fn run() -> Result<()> {
    let matches = app().get_matches();

    // The prompt is consumed before the tracee is launched, so a bad
    // register spelling never starts the target at all.
    let stdin = io::stdin();
    let var_map = read_var_map(&mut stdin.lock())?;
    log::debug!("profiling {} variable(s)", var_map.len());

    let tracer = Tracer {
        begin_addr: parse_addr(matches.value_of("begin-addr").unwrap())?,
        end_addr: parse_addr(matches.value_of("end-addr").unwrap())?,
        var_map,
        tracee_name: matches.value_of("tracee-name").unwrap().into(),
        tracee_args: matches
            .values_of("tracee-args")
            .map(|v| v.map(|a| a.to_string()).collect())
            .unwrap_or_else(Vec::new),
    };

    let mut passes = tracer.trace()?;

    match matches.value_of("output-format").unwrap() {
        "text" => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            passes.try_for_each(|p| p?.write_text(&mut out))?
        }
        "json" => serde_json::to_writer(
            io::stdout(),
            &passes.collect::<Result<Vec<RegionPass>>>()?,
        )?,
        _ => unreachable!(),
    };

    Ok(())
}

fn main() {
    env_logger::init();

    process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Fatal: {:#}", e);
            1
        }
    });
}
