use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use waterheater::protocol::{parse_status, Request, ERROR_REPLY};
use waterheater::simulation::{Mode, Snapshot};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "4242";
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

type ClientError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    let matches = App::new("waterheater")
        .version("0.1.0")
        .about("🔥 Water heater simulator client")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Simulator port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be between 0 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("on").about("🔥 Switch the heater on"))
        .subcommand(SubCommand::with_name("off").about("❄️  Switch the heater off"))
        .subcommand(SubCommand::with_name("status").about("🌡️  Show the current water temperature"))
        .subcommand(
            SubCommand::with_name("monitor")
                .about("📈 Print the live status stream")
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Monitor duration in seconds (default: infinite)")
                        .takes_value(true)
                        .validator(|v| match v.parse::<u64>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Duration must be a whole number of seconds".into()),
                        }),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");

    match matches.subcommand() {
        ("on", _) => handle_request(host, port, format, Request::Control(Mode::Heating)).await?,
        ("off", _) => handle_request(host, port, format, Request::Control(Mode::Cooling)).await?,
        ("status", _) => handle_request(host, port, format, Request::Status).await?,
        ("monitor", Some(sub_matches)) => handle_monitor(sub_matches, host, port, format).await?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start the simulator", "waterheater-sim".bright_cyan());
            println!("  {} Switch the heater on", "waterheater on".bright_cyan());
            println!("  {} Watch the temperature", "waterheater monitor".bright_cyan());
        }
    }

    Ok(())
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, ClientError> {
    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to simulator at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Server is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "waterheater-sim".bright_cyan());
            }
            Err(e.into())
        }
    }
}

async fn handle_request(host: &str, port: u16, format: &str, request: Request) -> Result<(), ClientError> {
    let stream = connect(host, port).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(request.as_wire().as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let expected = match request {
        Request::Control(mode) => Some(mode),
        Request::Status => None,
    };
    let snapshot = tokio::time::timeout(REPLY_TIMEOUT, await_reply(&mut lines, expected)).await??;
    print_snapshot(&snapshot, format);
    Ok(())
}

/// Reads until a status line in the expected mode arrives; broadcast lines
/// pushed before the command took effect are skipped.
async fn await_reply(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    expected: Option<Mode>,
) -> Result<Snapshot, ClientError> {
    while let Some(line) = lines.next_line().await? {
        if line.trim() == ERROR_REPLY {
            return Err("simulator rejected the command".into());
        }
        let snapshot = parse_status(&line)?;
        if expected.map_or(true, |mode| mode == snapshot.mode) {
            return Ok(snapshot);
        }
    }
    Err("server closed connection".into())
}

async fn handle_monitor(matches: &ArgMatches<'_>, host: &str, port: u16, format: &str) -> Result<(), ClientError> {
    let duration = matches
        .value_of("duration")
        .map(|d| d.parse::<u64>().map(Duration::from_secs))
        .transpose()?;

    if format != "json" {
        println!("{}", "📡 Monitoring water heater status (Press Ctrl+C to stop)...".bright_blue().bold());
    }

    let stream = connect(host, port).await?;
    let mut lines = BufReader::new(stream).lines();

    let stream_status = async {
        while let Some(line) = lines.next_line().await? {
            match parse_status(&line) {
                Ok(snapshot) => print_snapshot(&snapshot, format),
                Err(e) => eprintln!("{} {}", "⚠️".yellow(), e),
            }
        }
        Ok::<(), ClientError>(())
    };

    match duration {
        Some(duration) => match tokio::time::timeout(duration, stream_status).await {
            Ok(result) => result,
            Err(_) => Ok(()),
        },
        None => stream_status.await,
    }
}

fn print_snapshot(snapshot: &Snapshot, format: &str) {
    match format {
        "json" => match serde_json::to_string(snapshot) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{} {}", "❌".red(), e),
        },
        "compact" => println!(
            "[{}] {:.3}°C {}",
            snapshot.timestamp_ns / 1_000_000,
            snapshot.water_temp_c,
            snapshot.mode.as_wire()
        ),
        _ => {
            let heater = match snapshot.mode {
                Mode::Heating => "ON (heating)".bright_red(),
                Mode::Cooling => "OFF (cooling)".bright_blue(),
            };
            println!("{} {}", "🌡️ ".bright_blue(), "Water Heater Status".bright_blue().bold());
            println!("{} {:.3} °C", "Water Temperature:".bright_white(), snapshot.water_temp_c);
            println!("{} {}", "Heater:".bright_white(), heater);
            println!("{} {} ns", "Timestamp:".bright_white(), snapshot.timestamp_ns);
        }
    }
}
