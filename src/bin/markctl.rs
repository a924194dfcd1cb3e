use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use marking_gateway::protocol::{self, error_id, response_id, Message};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let matches = App::new("markctl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🏭 Command-line client for the industrial marking gateway")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Gateway host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Gateway port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
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
        .subcommand(SubCommand::with_name("heartbeat").about("💓 Check that the gateway is alive"))
        .subcommand(SubCommand::with_name("status").about("📊 Get system status"))
        .subcommand(
            SubCommand::with_name("mark")
                .about("🖨️  Request a marking cycle")
                .arg(Arg::with_name("serial").help("Serial number to mark").required(true))
                .arg(
                    Arg::with_name("product")
                        .long("product")
                        .value_name("JSON")
                        .help("Additional product data as a JSON object")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("configure")
                .about("⚙️  Send a configuration update")
                .arg(Arg::with_name("key").required(true))
                .arg(Arg::with_name("value").help("JSON value, or a plain string").required(true)),
        )
        .subcommand(
            SubCommand::with_name("command")
                .about("🔧 Send a system command")
                .arg(
                    Arg::with_name("name")
                        .required(true)
                        .possible_values(&["shutdown", "reset_statistics", "system_test"]),
                ),
        )
        .subcommand(SubCommand::with_name("monitor").about("📡 Follow status broadcasts"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");

    let request = match matches.subcommand() {
        ("heartbeat", _) => Message::new(request_id(), "heartbeat", json!({})),
        ("status", _) => Message::new(request_id(), "status_request", json!({})),
        ("mark", Some(sub)) => Message::new(request_id(), "marking_request", marking_payload(sub)?),
        ("configure", Some(sub)) => {
            let key = sub.value_of("key").unwrap_or_default();
            let raw = sub.value_of("value").unwrap_or_default();
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Message::new(request_id(), "configuration_update", json!({ "configuration": { key: value } }))
        }
        ("command", Some(sub)) => Message::new(
            request_id(),
            "system_command",
            json!({ "command": sub.value_of("name").unwrap_or_default() }),
        ),
        ("monitor", _) => return monitor(host, port, format).await,
        _ => return Ok(()),
    };

    let reply = send_request(host, port, &request).await?;
    print_reply(&reply, format);
    Ok(())
}

fn request_id() -> String {
    format!("markctl_{}", chrono::Utc::now().timestamp_millis())
}

fn marking_payload(matches: &ArgMatches<'_>) -> CliResult<Value> {
    let mut product = match matches.value_of("product") {
        Some(raw) => serde_json::from_str::<Value>(raw)?,
        None => json!({}),
    };
    if !product.is_object() {
        return Err("--product must be a JSON object".into());
    }
    product["serial_number"] = json!(matches.value_of("serial").unwrap_or_default());
    Ok(json!({ "product_data": product }))
}

/// Send one request and wait for its correlated reply, skipping broadcasts.
async fn send_request(host: &str, port: u16, request: &Message) -> CliResult<Message> {
    let addr = format!("{}:{}", host, port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} Failed to connect to gateway at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Gateway is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "marking-gateway --simulate".bright_cyan());
            }
            return Err(e.into());
        }
    };

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let expected = [response_id(&request.message_id), error_id(&request.message_id)];

    let exchange = async {
        writer.write_all(protocol::encode(request)?.as_bytes()).await?;
        while let Some(line) = lines.next_line().await? {
            let message = protocol::decode(&line)?;
            if expected.contains(&message.message_id) {
                return Ok(message);
            }
        }
        Err::<Message, Box<dyn std::error::Error>>("Gateway closed the connection".into())
    };

    match tokio::time::timeout(REQUEST_TIMEOUT, exchange).await {
        Ok(result) => result,
        Err(_) => {
            eprintln!("{} No reply after {} seconds", "⏰".yellow(), REQUEST_TIMEOUT.as_secs());
            Err("Request timeout".into())
        }
    }
}

fn print_reply(reply: &Message, format: &str) {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(reply).unwrap_or_default()),
        "compact" => {
            let status = if reply.is_error() { "ERROR".red() } else { "OK".green() };
            println!("[{}] {} {}", status, reply.message_type, reply.payload);
        }
        _ => {
            if reply.is_error() {
                println!(
                    "{} {} {}",
                    "❌".red(),
                    reply.payload_str("error_type").unwrap_or("Error").bright_red(),
                    reply.payload_str("error").unwrap_or_default()
                );
                return;
            }
            println!("{} {}", "✅".green(), reply.message_type.bright_green().bold());
            print_fields(&reply.payload, 1);
        }
    }
}

fn print_fields(value: &Value, depth: usize) {
    let Some(fields) = value.as_object() else {
        return;
    };
    let indent = "  ".repeat(depth);
    for (key, value) in fields {
        match value {
            Value::Object(_) => {
                println!("{}{}", indent, format!("{}:", key).bright_white());
                print_fields(value, depth + 1);
            }
            Value::Bool(true) => println!("{}{} {}", indent, format!("{}:", key).bright_white(), "true".green()),
            Value::Bool(false) => println!("{}{} {}", indent, format!("{}:", key).bright_white(), "false".yellow()),
            Value::Null => println!("{}{} {}", indent, format!("{}:", key).bright_white(), "n/a".dimmed()),
            other => println!("{}{} {}", indent, format!("{}:", key).bright_white(), other),
        }
    }
}

async fn monitor(host: &str, port: u16, format: &str) -> CliResult<()> {
    let stream = TcpStream::connect((host, port)).await?;
    let mut lines = BufReader::new(stream).lines();

    if format == "table" {
        println!("{}", "┌──────────────────────────┬────────────┬──────────┬───────┬────────┬─────────┐".bright_white());
        println!("{}", "│ Time                     │ Controller │ Hardware │ Marks │ Errors │ Clients │".bright_blue().bold());
        println!("{}", "├──────────────────────────┼────────────┼──────────┼───────┼────────┼─────────┤".bright_white());
    }

    while let Some(line) = lines.next_line().await? {
        let Ok(message) = protocol::decode(&line) else {
            continue;
        };
        let status = &message.payload["system_status"];
        match format {
            "json" => println!("{}", line),
            "compact" => println!(
                "[{}] {} | marks {} | errors {}",
                message.timestamp,
                status["controller_status"].as_str().unwrap_or("?"),
                status["marks_completed"],
                status["error_count"]
            ),
            _ => {
                let hardware = if status["hardware_connected"].as_bool().unwrap_or(false) {
                    "   UP   ".bright_green()
                } else {
                    "  DOWN  ".bright_red()
                };
                println!(
                    "│ {:<24} │ {:<10} │ {} │ {:>5} │ {:>6} │ {:>7} │",
                    message.timestamp,
                    status["controller_status"].as_str().unwrap_or("?"),
                    hardware,
                    status["marks_completed"].as_u64().unwrap_or(0),
                    status["error_count"].as_u64().unwrap_or(0),
                    status["client_count"].as_u64().unwrap_or(0)
                );
            }
        }
    }
    Ok(())
}
