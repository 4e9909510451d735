//! webrtc-call-relay binary
//!
//! Serves the demo page and `/call` on the tokio runtime while the main thread
//! hosts the media pipelines.
//!
//! Usage:
//!   webrtc-call-relay --listen 0.0.0.0:8888 --static-dir ./static
//!   webrtc-call-relay --sink dump --dump-dir ./dump
//!   webrtc-call-relay --ice-server stun:stun.l.google.com:19302

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use webrtc_call_relay::{
    CallServer, PipelineHost, RelayConfig, RtcEngine, SessionNegotiator, ShutdownSignal, SinkKind,
};

/// Answers browser WebRTC calls and plays the received media locally
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0:8888", env = "RELAY_LISTEN")]
    listen: SocketAddr,

    /// Directory with index.html and the demo assets
    #[arg(long, default_value = "static", env = "RELAY_STATIC_DIR")]
    static_dir: PathBuf,

    /// ICE server, `url` or `url|username|credential` (repeatable, comma-separated in env)
    #[arg(long = "ice-server", value_delimiter = ',', env = "RELAY_ICE_SERVERS")]
    ice_servers: Vec<String>,

    /// Seconds to wait for ICE gathering before failing a call
    #[arg(long, default_value_t = 30, env = "RELAY_GATHER_TIMEOUT")]
    gather_timeout_secs: u64,

    /// Where received media goes
    #[arg(long, default_value = "gstreamer", env = "RELAY_SINK")]
    sink: SinkArg,

    /// gst-launch executable (gstreamer sink)
    #[arg(long, default_value = "gst-launch-1.0", env = "RELAY_GST_LAUNCH")]
    gst_launch: PathBuf,

    /// Output directory (dump sink)
    #[arg(long, default_value = "dump", env = "RELAY_DUMP_DIR")]
    dump_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum SinkArg {
    /// Render through GStreamer
    Gstreamer,
    /// Write raw chunks to files
    Dump,
}

impl From<SinkArg> for SinkKind {
    fn from(arg: SinkArg) -> Self {
        match arg {
            SinkArg::Gstreamer => SinkKind::Gstreamer,
            SinkArg::Dump => SinkKind::Dump,
        }
    }
}

impl From<Args> for RelayConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            static_dir: args.static_dir,
            ice_servers: args.ice_servers,
            gather_timeout: Duration::from_secs(args.gather_timeout_secs),
            sink: args.sink.into(),
            gst_launch: args.gst_launch,
            dump_dir: args.dump_dir,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RelayConfig::from(Args::parse());
    info!("Starting webrtc-call-relay with {:?}", config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("call-relay")
        .build()?;

    // The host runs on this thread once everything else is up.
    let (host, pipelines) = PipelineHost::new(config.pipeline_factory());

    let engine = Arc::new(RtcEngine::new(config.ice_server_configs())?);
    let negotiator = Arc::new(
        SessionNegotiator::new(engine, pipelines.clone()).with_gather_timeout(config.gather_timeout),
    );

    let server = runtime.block_on(CallServer::bind(
        config.listen,
        config.static_dir.clone(),
        negotiator.clone(),
    ))?;

    let shutdown = ShutdownSignal::new();
    runtime.spawn(server.serve(shutdown.clone()));
    runtime.spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C, shutting down: {}", e),
        }
        shutdown.trigger();
        negotiator.sessions().close_all().await;
        pipelines.shutdown().await;
    });

    host.run();

    runtime.shutdown_timeout(Duration::from_secs(2));
    info!("Stopped");
    Ok(())
}
