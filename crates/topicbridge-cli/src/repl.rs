//! Interactive control shell.
//!
//! Every line other than `help`, `status json` and `quit`/`exit` is handed
//! to [`Gateway::dispatch_line`], so the shell accepts exactly the gateway's
//! command set.

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::sync::atomic::{AtomicBool, Ordering};

use topicbridge_runtime::{CommandReply, Gateway, GatewayStatus, SocketStatus};
use topicbridge_topics::TopicSummary;

/// Run the shell until `quit`, EOF, Ctrl-C, or `shutdown` is set.
pub fn run(gateway: &Gateway, shutdown: &AtomicBool) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            return;
        }
    };
    let prompt = format!("{} ", "topicbridge>".bold().cyan());

    while !shutdown.load(Ordering::SeqCst) {
        let line = match editor.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        let cmd = line.trim();
        if cmd.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(cmd);

        match cmd {
            "help" => print_help(),
            "quit" | "exit" => {
                println!("{}", "Goodbye.".green());
                break;
            }
            "status json" => match serde_json::to_string_pretty(&gateway.status()) {
                Ok(json) => println!("{json}"),
                Err(e) => println!("{}: {}", "Serialisation error".red(), e),
            },
            other => match gateway.dispatch_line(other) {
                Ok(reply) => print_reply(&reply),
                Err(e) => println!("{} {}", "✗".red().bold(), e),
            },
        }
    }
}

fn print_help() {
    println!();
    println!("{}", "Gateway Commands".bold().underline());
    let rows = [
        ("noop", "log the gateway version"),
        ("reset", "zero all counters"),
        ("status [json]", "show counters and socket state"),
        ("topics", "list registered topics"),
        ("subscribe <id> <bus|external>", "subscribe a topic"),
        ("unsubscribe <id> <bus|external>", "unsubscribe a topic"),
        ("role <id> <publish|subscribe>", "subscribe a topic for a network role"),
        ("test start [id] [param]", "start the periodic self-test"),
        ("test stop", "stop the self-test"),
        ("quit  exit", "stop the gateway and exit"),
    ];
    for (cmd, what) in rows {
        println!("  {:<34} – {}", cmd.bold().cyan(), what);
    }
    println!();
}

fn print_reply(reply: &CommandReply) {
    match reply {
        CommandReply::Done(msg) => println!("{} {}", "✓".green().bold(), msg),
        CommandReply::Status(status) => print_status(status),
        CommandReply::Topics(topics) => print_topics(topics),
    }
}

fn print_status(status: &GatewayStatus) {
    let t = &status.translator;
    println!("{}", "Translator".bold().underline());
    println!(
        "  inbound   {} valid  {} invalid",
        t.valid_inbound.to_string().green(),
        t.invalid_inbound.to_string().red()
    );
    println!(
        "  outbound  {} valid  {} invalid",
        t.valid_outbound.to_string().green(),
        t.invalid_outbound.to_string().red()
    );
    println!("{}", "Sockets".bold().underline());
    print_socket("rx", &status.rx);
    print_socket("tx", &status.tx);
    println!("{}", "Commands".bold().underline());
    println!(
        "  {} valid  {} invalid",
        status.commands.valid.to_string().green(),
        status.commands.invalid.to_string().red()
    );
    let st = &status.self_test;
    match (st.active, st.plugin_id) {
        (true, Some(id)) => println!("  self-test running on plugin {} (param {})", id, st.param),
        _ => println!("  self-test {}", "idle".dimmed()),
    }
    println!("  {} topics registered", status.topic_count);
}

fn print_socket(label: &str, socket: &SocketStatus) {
    let state = if socket.connected {
        "connected".green()
    } else {
        "down".yellow()
    };
    println!(
        "  {label}  {state}  {} messages  {} errors",
        socket.messages,
        socket.errors.to_string().red()
    );
}

fn print_topics(topics: &[TopicSummary]) {
    if topics.is_empty() {
        println!("  {}", "no topics registered".dimmed());
        return;
    }
    for t in topics {
        let flags = match (t.subscription.bus, t.subscription.external) {
            (true, true) => "bus+external",
            (true, false) => "bus",
            (false, true) => "external",
            (false, false) => "-",
        };
        println!(
            "  {:>3}  {}  {:<10}  {:<24} {:<12} ↑{} ↓{}",
            t.plugin_id.to_string().bold(),
            t.bus_id,
            t.kind.to_string(),
            t.name.cyan(),
            flags,
            t.stats.to_bus,
            t.stats.to_json
        );
    }
}
