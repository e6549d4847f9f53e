//! Command-line client for the background transfer daemon.
//!
//! Every invocation opens one connection to the daemon, sends one
//! command, prints a human-readable summary of the response, and exits.
//! The daemon itself keeps running between invocations.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    process::{Command, Stdio},
};

use anyhow::Context;
use ecmwf_api::RequestParams;
use ecmwf_daemon::{
    framed::FramedConnection,
    protocol::{Envelope, Response, TaskSummary, TransferAdded},
};
use serde_json::json;

/// Command-line client for the ECMWF background transfer daemon.
#[derive(argh::FromArgs)]
struct Args {
    /// port of the daemon command server. Default: 54500.
    #[argh(option, default = "ecmwf_daemon::DEFAULT_PORT")]
    port: u16,

    #[argh(subcommand)]
    command: Subcommand,
}

#[derive(argh::FromArgs)]
#[argh(subcommand)]
enum Subcommand {
    Status(StatusArgs),
    Start(StartArgs),
    Stop(StopArgs),
    ListActive(ListActiveArgs),
    ListCompleted(ListCompletedArgs),
    Add(AddArgs),
    Cancel(CancelArgs),
}

/// Check whether the background client is running.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "status")]
struct StatusArgs {}

/// Start the background client.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "start")]
struct StartArgs {}

/// Stop the background client. Any active transfers will be finished.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "stop")]
struct StopArgs {}

/// List the currently active transfers.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "list_active_transfers")]
struct ListActiveArgs {}

/// List the transfers completed since the background client was started.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "list_completed_transfers")]
struct ListCompletedArgs {}

/// Queue a new transfer. Parameters are either given inline as
/// comma-separated `key:value` pairs (e.g.
/// `class:s2,dataset:s2s,date:2015-01-01,target:test`) or as the path of
/// a file with one `key: value` pair per line.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "add_transfer")]
struct AddArgs {
    /// transfer parameters, inline or as a file path.
    #[argh(positional)]
    parameters: String,
}

/// Cancel a queued transfer. Transfers that already started cannot be
/// cancelled.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "cancel_transfer")]
struct CancelArgs {
    /// id of the transfer to cancel.
    #[argh(positional)]
    task_id: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args: Args = argh::from_env();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), args.port);

    match args.command {
        Subcommand::Status(_) => status(addr).await,
        Subcommand::Start(_) => start(addr).await,
        Subcommand::Stop(_) => stop(addr).await,
        Subcommand::ListActive(_) => list_transfers(addr, false).await,
        Subcommand::ListCompleted(_) => list_transfers(addr, true).await,
        Subcommand::Add(add) => add_transfer(addr, &add.parameters).await,
        Subcommand::Cancel(cancel) =>
            cancel_transfer(addr, cancel.task_id).await,
    }
}

async fn status(addr: SocketAddr) {
    match send_command(addr, "heartbeat", json!({})).await {
        Response::Ok { .. } => println!("The background client is active"),
        Response::Error { .. } =>
            println!("The background client is not running"),
    }
}

async fn start(addr: SocketAddr) {
    let heartbeat = send_command(addr, "heartbeat", json!({})).await;
    if matches!(heartbeat, Response::Ok { .. }) {
        println!("The background client is already running");
        return;
    }
    match spawn_daemon() {
        Ok(()) => println!("The background client has been started"),
        Err(error) =>
            println!("Failed to start the background client: {error:#}"),
    }
}

async fn stop(addr: SocketAddr) {
    match send_command(addr, "stop", json!({})).await {
        Response::Ok { .. } => println!(
            "The background client has been stopped. Any active transfers \
             will be finished."
        ),
        Response::Error { .. } =>
            println!("The background client was not active"),
    }
}

async fn list_transfers(addr: SocketAddr, completed: bool) {
    let command = if completed {
        "list_completed_transfers"
    } else {
        "list_active_transfers"
    };
    let data = match send_command(addr, command, json!({})).await {
        Response::Ok { data } => data,
        Response::Error { error_message } => {
            println!(
                "An error occurred while listing transfers: {error_message}"
            );
            return;
        }
    };
    let transfers: Vec<TaskSummary> = match serde_json::from_value(data) {
        Ok(transfers) => transfers,
        Err(_) => {
            println!(
                "An error occurred while listing transfers: malformed \
                 response"
            );
            return;
        }
    };

    if transfers.is_empty() {
        if completed {
            println!("No transfers completed");
        } else {
            println!("No transfers currently active");
        }
        return;
    }

    println!("{}", "-".repeat(70));
    println!("Task added             Task status    Task ID");
    println!("{}", "-".repeat(70));
    for item in transfers {
        println!(
            "{}    {:<15}{}",
            item.task_added,
            item.task_status.as_str(),
            item.task_id
        );
    }
}

async fn add_transfer(addr: SocketAddr, parameters: &str) {
    let parameters = match parse_transfer_parameters(parameters) {
        Ok(parameters) => parameters,
        Err(error) => {
            println!("{error}");
            return;
        }
    };
    match send_command(addr, "add_transfer", json!(parameters)).await {
        Response::Ok { data } =>
            match serde_json::from_value::<TransferAdded>(data) {
                Ok(added) => println!(
                    "The transfer was successfully added with task_id {}",
                    added.task_id
                ),
                Err(_) => println!(
                    "An error occurred while adding the transfer: malformed \
                     response"
                ),
            },
        Response::Error { error_message } => println!(
            "An error occurred while adding the transfer: {error_message}"
        ),
    }
}

async fn cancel_transfer(addr: SocketAddr, task_id: String) {
    let data = json!({ "task_id": task_id });
    match send_command(addr, "cancel_transfer", data).await {
        Response::Ok { .. } => println!("The transfer was cancelled"),
        Response::Error { error_message } => println!(
            "An error occurred while cancelling the transfer: \
             {error_message}"
        ),
    }
}

/// Sends one command to the daemon. Communication problems are folded
/// into an error response so callers only deal in responses.
async fn send_command(
    addr: SocketAddr,
    command: &str,
    data: serde_json::Value,
) -> Response {
    match try_send_command(addr, command, data).await {
        Ok(response) => response,
        Err(_) => Response::error("API communication failure"),
    }
}

async fn try_send_command(
    addr: SocketAddr,
    command: &str,
    data: serde_json::Value,
) -> anyhow::Result<Response> {
    let mut connection = FramedConnection::connect(addr).await?;
    let envelope = Envelope::new(command, data);
    connection.send(&serde_json::to_string(&envelope)?).await?;
    let response = connection
        .receive()
        .await?
        .context("Connection closed without a response")?;
    let _ = connection.close().await;
    Ok(serde_json::from_str(&response)?)
}

/// Launches the daemon binary detached, preferring the one installed
/// next to this executable.
fn spawn_daemon() -> anyhow::Result<()> {
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("ecmwf-daemon")))
        .filter(|path| path.exists());
    let program = sibling.unwrap_or_else(|| PathBuf::from("ecmwf-daemon"));
    Command::new(program)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to launch ecmwf-daemon")?;
    Ok(())
}

/// Parses transfer parameters: either inline `k:v,k:v,…` (whitespace is
/// stripped first) or the path of a file whose lines are `k: v` pairs.
fn parse_transfer_parameters(input: &str) -> Result<RequestParams, String> {
    // A colon in the input means the parameters are inline; anything
    // else is taken as a file name.
    if input.contains(':') {
        let stripped: String = input.split_whitespace().collect();
        parse_parameter_items(stripped.split(',')).ok_or_else(|| {
            "Incorrect transfer data given, see 'add_transfer --help' for \
             the syntax"
                .to_owned()
        })
    } else {
        let contents = match std::fs::read_to_string(input) {
            Ok(contents) => contents,
            Err(_) => return Err(format!("File '{input}' not found")),
        };
        let lines = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty());
        parse_parameter_items(lines).ok_or_else(|| {
            "Incorrect transfer data in file, see 'add_transfer --help' for \
             the syntax"
                .to_owned()
        })
    }
}

fn parse_parameter_items<'a>(
    items: impl Iterator<Item = &'a str>,
) -> Option<RequestParams> {
    let mut parameters = RequestParams::new();
    for item in items {
        let (key, value) = item.split_once(':')?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() || value.contains(':') {
            return None;
        }
        parameters.insert(key.to_owned(), value.to_owned());
    }
    Some(parameters)
}
