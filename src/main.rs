use anyhow::{bail, Context, Error, Result};
use bstr::ByteSlice;
use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use log::{debug, LevelFilter};
use ripline::{
    line_buffer::{LineBufferBuilder, LineBufferReader},
    lines::LineIter,
};
use std::io::{self, IsTerminal, Write};
use std::process::ExitCode;
use std::sync::Arc;
use termcolor::{BufferedStandardStream, Color, ColorChoice, ColorSpec, WriteColor};

use geoipenv::config::ModuleConfig;
use geoipenv::input::FileOrStdin;
use geoipenv::{directive, DatabaseRegistry, GeoIpModule, Pipeline, Request};

/// Check if the error chain contains a broken pipe error.
#[inline(always)]
fn is_broken_pipe(err: &Error) -> bool {
    for cause in err.chain() {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::BrokenPipe {
                return true;
            }
        }
    }
    false
}

/// Print the GEOIP_* variables a server would bind for each client address.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Directive file with MaxMindDBEnable, MaxMindDBFile and MaxMindDBEnv
    #[clap(
        short,
        long,
        value_name = "FILE",
        value_hint = clap::ValueHint::FilePath,
        env = "GEOIPENV_CONFIG",
        conflicts_with = "db"
    )]
    config: Option<Utf8PathBuf>,

    /// Enable the main server scope with this database instead of a config file
    #[clap(long, value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    db: Option<Utf8PathBuf>,

    /// Host header of the simulated request, selects the virtual host
    #[clap(long)]
    host: Option<String>,

    /// URI path of the simulated request, matched against <Location> sections
    #[clap(long, default_value = "/")]
    uri: String,

    /// Mapped filesystem path of the request, matched against <Directory> sections
    #[clap(long, value_name = "PATH")]
    filename: Option<Utf8PathBuf>,

    /// Print one JSON object per address
    #[clap(long)]
    json: bool,

    /// Color variable names
    #[clap(short = 'C', long, value_enum, default_value_t = ArgsColorChoice::Auto)]
    color: ArgsColorChoice,

    /// Log at debug level (RUST_LOG takes precedence)
    #[clap(short, long)]
    verbose: bool,

    /// Open every configured database, report which are usable and exit
    #[clap(long)]
    list_databases: bool,

    /// Files of client addresses, one per line. Leave empty or use "-" to read from stdin
    #[clap(value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    input: Vec<Utf8PathBuf>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum ArgsColorChoice {
    Always,
    Never,
    Auto,
}

fn main() -> ExitCode {
    let err = match run_main() {
        Ok(code) => return code,
        Err(err) => err,
    };

    if is_broken_pipe(&err) {
        return ExitCode::SUCCESS;
    }

    let mut stderr = io::stderr();
    if std::env::var("RUST_BACKTRACE").is_ok_and(|v| v == "1")
        && std::env::var("RUST_LIB_BACKTRACE").map_or(true, |v| v == "1")
    {
        let _ = writeln!(stderr, "{:?}", err);
    } else {
        let _ = writeln!(stderr, "{:#}", err);
    }

    ExitCode::FAILURE
}

fn run_main() -> Result<ExitCode> {
    let mut args = Args::parse();

    let default_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .init();

    let config = load_config(&args)?;
    let databases = DatabaseRegistry::default();
    let usable = databases.preload(&config);
    debug!("{usable} of {} databases usable", config.database_paths().len());

    if args.list_databases {
        for (path, ok) in databases.status() {
            let mark = if ok { "✓" } else { "✗" };
            println!("{mark} {path}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    // if no files specified, add stdin
    if args.input.is_empty() {
        args.input.push(Utf8PathBuf::from("-"));
    }

    // auto only colors when stdout is a terminal
    let colormode = match args.color {
        ArgsColorChoice::Auto => {
            if io::stdout().is_terminal() {
                ColorChoice::Always
            } else {
                ColorChoice::Never
            }
        }
        ArgsColorChoice::Always => ColorChoice::Always,
        ArgsColorChoice::Never => ColorChoice::Never,
    };

    let module = Arc::new(GeoIpModule::new(Arc::new(config), Arc::new(databases)));
    let mut pipeline = Pipeline::new();
    module.register(&mut pipeline);
    pipeline.build()?;

    run(&args, &pipeline, colormode)?;
    Ok(ExitCode::SUCCESS)
}

fn load_config(args: &Args) -> Result<ModuleConfig> {
    if let Some(path) = &args.config {
        return directive::load(path)
            .with_context(|| format!("failed to load configuration {path}"));
    }
    let Some(db) = &args.db else {
        bail!("no configuration: pass --config <FILE> or --db <FILE>");
    };
    let mut config = ModuleConfig::default();
    config.main.server.scope.enabled = true;
    config.main.server.scope.database = Some(db.clone());
    Ok(config)
}

fn run(args: &Args, pipeline: &Pipeline, colormode: ColorChoice) -> Result<()> {
    let mut out = BufferedStandardStream::stdout(colormode);
    let mut line_buffer = LineBufferBuilder::new().capacity(65536).build();
    let mut printed = false;

    for path in &args.input {
        let file = FileOrStdin::from_path(path.clone());
        let reader = file.reader()?;
        let mut lb_reader = LineBufferReader::new(reader, &mut line_buffer);

        while lb_reader.fill().with_context(|| format!("failed to read {file}"))? {
            for line in LineIter::new(b'\n', lb_reader.buffer()) {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let client_ip = line.to_str_lossy();
                let mut request = Request::new(client_ip, args.uri.as_str());
                request.host = args.host.clone();
                request.filename = args.filename.clone();
                pipeline.process(&mut request)?;

                if args.json {
                    serde_json::to_writer(&mut out, &request.vars)?;
                    out.write_all(b"\n")?;
                } else if !request.vars.is_empty() {
                    if printed {
                        out.write_all(b"\n")?;
                    }
                    write_vars(&mut out, &request)?;
                    printed = true;
                }
            }
            lb_reader.consume_all();
        }
        out.flush()?;
    }

    Ok(())
}

fn write_vars<W: WriteColor>(out: &mut W, request: &Request) -> io::Result<()> {
    let mut name_color = ColorSpec::new();
    name_color.set_fg(Some(Color::Green)).set_bold(true);
    for (name, value) in request.vars.iter() {
        out.set_color(&name_color)?;
        out.write_all(name.as_bytes())?;
        out.reset()?;
        writeln!(out, "={value}")?;
    }
    Ok(())
}
