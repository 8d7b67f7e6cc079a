//! robotd command line.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use robotd::mock::MockDevice;
use robotd::protocol::Reply;
use robotd::{controller, logging, supervisor, Client, Config, Device, DeviceKind, V4L2Device};

#[derive(Parser, Debug)]
#[command(name = "robotd", version, about = "Robot peripheral daemon")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for endpoint sockets (overrides `root_dir`).
    #[arg(long, global = true)]
    root_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise devices (the default).
    Supervise,
    /// Serve one device on one endpoint.
    #[command(hide = true)]
    Controller {
        /// Device type.
        #[arg(long)]
        kind: DeviceKind,
        /// Instance id.
        #[arg(long)]
        id: String,
        /// Device node.
        #[arg(long)]
        node: PathBuf,
        /// Endpoint socket path.
        #[arg(long)]
        endpoint: PathBuf,
    },
    /// Send one JSON request to an endpoint and print the replies.
    Query {
        /// Endpoint socket path.
        endpoint: PathBuf,
        /// Request, e.g. '{"op":"identify"}'.
        request: String,
    },
}

fn main() {
    if let Err(err) = run(Cli::parse()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> robotd::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }

    match cli.command.unwrap_or(Command::Supervise) {
        Command::Supervise => {
            logging::init(&config.logging)?;
            supervisor::supervise(&config, cli.config.as_deref())
        }
        Command::Controller {
            kind,
            id,
            node,
            endpoint,
        } => {
            logging::init(&config.logging)?;
            let device = Device::new(kind, id, node)?;
            let settings = config.driver_settings();
            if settings.camera.simulate {
                controller::run::<MockDevice>(&device, &endpoint, &settings)
            } else {
                controller::run::<V4L2Device>(&device, &endpoint, &settings)
            }
        }
        Command::Query { endpoint, request } => query(&endpoint, &request),
    }
}

fn query(endpoint: &Path, request: &str) -> robotd::Result<()> {
    let request = serde_json::from_str(request)?;
    let (client, greeting) = Client::connect(endpoint)?;
    println!("{}", serde_json::to_string(&greeting.reply)?);
    let response = client.request(&request)?;
    println!("{}", serde_json::to_string(&response.reply)?);
    if let Reply::Frame(_) = response.reply {
        println!("({} payload bytes)", response.payload.len());
    }
    Ok(())
}
