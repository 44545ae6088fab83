use clap::{Arg, ArgAction, ArgMatches, Command};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod codegen;
mod elf;
mod error;
mod lexer;
mod symbols;

use error::CompileError;

fn main() {
    let matches = build_cli().try_get_matches().unwrap_or_else(|err| {
        if matches!(
            err.kind(),
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
        ) {
            let _ = err.print();
            process::exit(0);
        }
        eprintln!("usage: wavec <input> -o <output>");
        process::exit(1);
    });

    init_tracing(matches.get_count("verbose"));

    if let Err(e) = run(&matches) {
        eprintln!("Error: compilation failed: {}", e);
        process::exit(1);
    }
}

fn build_cli() -> Command {
    Command::new("wavec")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Compiles Wave source directly to a static Linux x86-64 executable")
        .arg(
            Arg::new("input")
                .value_name("FILE")
                .help("Input Wave source file")
                .required(true),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Output executable path")
                .required(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase log verbosity")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("dump-code")
                .long("dump-code")
                .help("Hex-dump the generated machine code before the ELF wrap")
                .action(ArgAction::SetTrue),
        )
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_env_filter(env_filter)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run(matches: &ArgMatches) -> Result<(), CompileError> {
    let input = matches.get_one::<String>("input").expect("required arg");
    let output = matches.get_one::<String>("output").expect("required arg");
    let dump_code = matches.get_flag("dump-code");

    compile_file(Path::new(input), Path::new(output), dump_code)
}

/// Read, compile, wrap, and write one program.
fn compile_file(input: &Path, output: &Path, dump_code: bool) -> Result<(), CompileError> {
    let source = fs::read(input)?;
    info!(path = %input.display(), bytes = source.len(), "read source");

    let code = codegen::compile(&source)?;
    info!(bytes = code.len(), "generated machine code");
    if dump_code {
        dump_hex(&code);
    }

    let image = elf::build_image(&code);
    fs::write(output, &image)?;
    fs::set_permissions(output, fs::Permissions::from_mode(0o755))?;
    info!(path = %output.display(), bytes = image.len(), "wrote executable");
    Ok(())
}

fn dump_hex(code: &[u8]) {
    for (row, chunk) in code.chunks(16).enumerate() {
        let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:08x}  {}", row * 16, bytes.join(" "));
    }
}
