//! muxnetd - minimal upload daemon over the muxnet engine.
//!
//! Listens for HTTP requests, stores multipart file uploads into the
//! configured directory, and answers with a terse status line. Mostly a
//! demonstration of driving the poll loop end to end.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use muxnet::config::{self, Config};
use muxnet::{Event, Manager, SocketTransport};

#[derive(Parser, Debug)]
#[command(name = "muxnetd", about = "muxnet upload daemon")]
struct Args {
    /// Path to the YAML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the config.
    #[arg(short, long)]
    listen: Option<String>,

    /// Upload destination directory, overriding the config.
    #[arg(short, long)]
    upload_dir: Option<String>,
}

fn init_logging() {
    tracing_log::LogTracer::init().expect("log tracer");
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("subscriber");
}

fn main() {
    init_logging();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => match config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::error!("{}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if let Some(dir) = args.upload_dir {
        cfg.upload_dir = dir;
    }
    if let Err(e) = cfg.validate() {
        log::error!("{}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(&cfg) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let listen = cfg.listen_endpoint()?;
    let upload_dir = PathBuf::from(&cfg.upload_dir);
    let timeout = Duration::from_millis(cfg.poll_ms);

    let transport = SocketTransport::new()?;
    let mut mgr = Manager::with_buf_capacity(transport, cfg.buf_size);
    mgr.listen(&listen)?;
    log::info!("listening on {}, uploads to {}", listen, upload_dir.display());

    loop {
        for event in mgr.poll_once(timeout)? {
            match event {
                Event::RequestReady { conn } => {
                    match mgr.receive_upload(conn, &upload_dir) {
                        Ok(upload) => {
                            log::info!("conn {}: stored {}", conn, upload.path.display());
                            mgr.send(conn, b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nok\n");
                        }
                        Err(e) => {
                            log::warn!("conn {}: upload failed: {}", conn, e);
                            mgr.send(
                                conn,
                                b"HTTP/1.1 400 Bad Request\r\nContent-Length: 5\r\n\r\nfail\n",
                            );
                        }
                    }
                    mgr.set_close_after_flush(conn);
                }
                Event::Overflow { conn } => {
                    mgr.send(
                        conn,
                        b"HTTP/1.1 431 Request Header Fields Too Large\r\nContent-Length: 0\r\n\r\n",
                    );
                    mgr.set_close_after_flush(conn);
                }
                Event::BadRequest { conn } => {
                    mgr.send(conn, b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n");
                    mgr.set_close_after_flush(conn);
                }
                Event::Accepted { conn } => {
                    log::debug!("conn {}: accepted", conn);
                }
                Event::Closed { conn } => {
                    log::debug!("conn {}: closed", conn);
                }
                Event::RelayEstablished { client } => {
                    log::debug!("conn {}: relay up", client);
                }
                Event::RelayFailed { client, error } => {
                    log::warn!("conn {}: relay failed: {}", client, error);
                }
            }
        }
    }
}
