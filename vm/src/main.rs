use clap::Parser as ClapParser;
use std::process;

use vm::config::{DomainCreateInfo, InterpOptions};
use vm::demos::{self, Demo};
use vm::{Domain, StackVal};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Demo programs to run
    #[arg(long, default_value = "all", help = "Demo to run: arith, fib, exceptions, dispatch or all")]
    demo: String,

    /// Integer arguments replacing the demo's own
    #[arg(long = "arg", help = "Entry argument (repeatable)")]
    args: Vec<i32>,

    /// Print transformed bytecode before running
    #[arg(long, help = "Disassemble the entry method")]
    dump: bool,

    /// Trace method entry and exit
    #[arg(long, help = "Trace calls and raise the log level to trace")]
    trace: bool,

    /// Interpreter options string
    #[arg(long = "interp-opts", default_value = "", help = "Options such as \"jit=Math,-inline,count-ops\"")]
    interp_opts: String,

    /// Print counters after the run
    #[arg(long, help = "Print interpreter statistics")]
    stats: bool,
}

fn main() {
    let cli = Cli::parse();
    let filter = if cli.trace { "trace" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let mut options = InterpOptions::parse(&cli.interp_opts);
    options.trace |= cli.trace;
    let info = DomainCreateInfo {
        options,
        ..DomainCreateInfo::default()
    };
    let domain = match Domain::new(info) {
        Ok(domain) => domain,
        Err(err) => {
            eprintln!("Error creating domain: {err}");
            process::exit(1);
        }
    };

    let names: Vec<&str> = if cli.demo == "all" {
        demos::NAMES.to_vec()
    } else {
        vec![cli.demo.as_str()]
    };

    let mut failed = false;
    for name in names {
        let demo = match demos::install(&domain, name) {
            Ok(demo) => demo,
            Err(err) => {
                eprintln!("Error installing {name}: {err}");
                process::exit(1);
            }
        };
        if cli.dump {
            dump_entry(&domain, &demo);
        }
        failed |= !run_demo(&domain, &demo, &cli.args);
    }

    if cli.stats {
        print!("{}", domain.stats().report());
    }
    if failed {
        process::exit(1);
    }
}

/// Run `demo`, printing its result. Returns `false` when it threw or
/// returned something other than expected with its own arguments.
fn run_demo(domain: &Domain, demo: &Demo, overrides: &[i32]) -> bool {
    let args: Vec<StackVal> = if overrides.is_empty() {
        demo.args.clone()
    } else {
        overrides.iter().copied().map(StackVal::from_i32).collect()
    };

    match domain.invoke(demo.entry, &args) {
        Ok(result) => {
            println!("{}: {}", demo.name, result.as_i32());
            if overrides.is_empty() && result.as_i32() != demo.expected {
                eprintln!("{}: expected {}", demo.name, demo.expected);
                return false;
            }
            true
        }
        Err(err) => {
            eprintln!("{}: {err}", demo.name);
            false
        }
    }
}

fn dump_entry(domain: &Domain, demo: &Demo) {
    let imethod = match domain.interp_method(demo.entry) {
        Ok(imethod) => imethod,
        Err(err) => {
            eprintln!("Error loading {}: {err}", demo.name);
            return;
        }
    };
    match domain.transformed(&imethod) {
        Ok(code) => {
            println!("== {} ==", imethod.full_name());
            print!("{}", bytecode::disassemble(&code.bytes));
            println!(
                "-- frame --\nstack={} vt={} locals={} clauses={}",
                code.stack_cells,
                code.vt_stack_size,
                code.locals_size,
                code.clauses.len()
            );
        }
        Err(err) => eprintln!("Error transforming {}: {err}", imethod.full_name()),
    }
}
