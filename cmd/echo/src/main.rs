//! urpc echo example
//!
//! Hosts `example.EchoService/Echo` or calls it.
//!
//! ```text
//! urpc-echo serve --listen 127.0.0.1:8000
//! urpc-echo call --server 127.0.0.1:8000 --message hello --count 3
//! urpc-echo call --server 127.0.0.1:8000 --protocol echo
//! ```
//!
//! # Environment Variables
//!
//! - `URPC_LOG=debug` - Log filter (tracing `EnvFilter` syntax, default `info`)
//! - `URPC_TIMEOUT_MS`, `URPC_CONNECT_TIMEOUT_MS` - Client deadlines
//! - `URPC_LISTEN_BACKLOG`, `URPC_REUSE_PORT` - Listener options

use std::cell::RefCell;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use urpc::{
    Channel, ChannelOptions, Controller, Done, EventLoop, MethodDescriptor, ProtocolType,
    Server, ServerOptions, ServiceBuilder, ServiceOwnership,
};

const SERVICE: &str = "example.EchoService";
const METHOD: &str = "Echo";

#[derive(Debug, Default, Serialize, Deserialize)]
struct EchoRequest {
    message: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EchoResponse {
    message: String,
}

#[derive(Parser)]
#[command(name = "urpc-echo", version, about = "Echo server and client over urpc")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host the echo service
    Serve {
        #[arg(long, default_value = "127.0.0.1:8000")]
        listen: String,
    },
    /// Call the echo service
    Call {
        #[arg(long, default_value = "127.0.0.1:8000")]
        server: String,
        #[arg(long, default_value = "hello world")]
        message: String,
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[arg(long, value_enum, default_value_t = Wire::Urpc)]
        protocol: Wire,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Wire {
    Urpc,
    Echo,
}

impl From<Wire> for ProtocolType {
    fn from(w: Wire) -> Self {
        match w {
            Wire::Urpc => ProtocolType::Urpc,
            Wire::Echo => ProtocolType::Echo,
        }
    }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("URPC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve { listen } => serve(&listen),
        Command::Call {
            server,
            message,
            count,
            protocol,
            wait_secs,
        } => call(&server, &message, count, protocol.into(), Duration::from_secs(wait_secs)),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "urpc-echo failed");
            ExitCode::FAILURE
        }
    }
}

fn serve(listen: &str) -> urpc::Result<ExitCode> {
    let mut ev = EventLoop::new()?;
    let mut server = Server::new(ServerOptions::default());
    let service = ServiceBuilder::new(SERVICE)
        .method(
            METHOD,
            |cntl: &Controller, req: EchoRequest, done: Done<EchoResponse>| {
                tracing::debug!(peer = ?cntl.remote_side(), log_id = cntl.log_id(), len = req.message.len(), "echo");
                done.finish(EchoResponse {
                    message: req.message,
                })
            },
        )
        .build();
    server.add_service(Rc::new(service), ServiceOwnership::ServerOwned)?;
    let local = server.start(&mut ev, listen)?;
    println!("listening on {}", local);

    ev.run_forever()?;
    server.stop(&mut ev);
    Ok(ExitCode::SUCCESS)
}

fn call(
    server: &str,
    message: &str,
    count: usize,
    protocol: ProtocolType,
    wait: Duration,
) -> urpc::Result<ExitCode> {
    let mut ev = EventLoop::new()?;
    let options = ChannelOptions::default().protocol(protocol);
    let channel = Channel::init(&mut ev, server, options)?;
    let method = MethodDescriptor::new(SERVICE, METHOD);

    let results: Rc<RefCell<Vec<(usize, Controller, EchoResponse)>>> = Rc::default();
    for i in 0..count {
        let mut cntl = Controller::new();
        cntl.set_log_id(i as u64);
        let results = Rc::clone(&results);
        channel.call(
            &mut ev,
            &method,
            cntl,
            &EchoRequest {
                message: message.to_owned(),
            },
            move |cntl, resp: EchoResponse| results.borrow_mut().push((i, cntl, resp)),
        );
    }

    let finished = ev.run_until(wait, || results.borrow().len() >= count)?;
    if !finished {
        eprintln!("{} of {} calls completed in {:?}", results.borrow().len(), count, wait);
    }

    let mut failed = 0;
    for (i, cntl, resp) in results.borrow().iter() {
        let latency = cntl.latency().unwrap_or_default();
        if cntl.failed() {
            failed += 1;
            println!("#{} failed: {} {} ({:?})", i, cntl.error_code(), cntl.error_text(), latency);
        } else {
            println!("#{} {:?} ({:?})", i, resp.message, latency);
        }
    }
    Ok(if failed == 0 && finished {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
