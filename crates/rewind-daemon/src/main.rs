use rewind_daemon::{controller, proxy, socket, BroadcastMessage};
use rewind_proto::config::Config;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// A tracing layer that forwards log messages to the broadcast channel.
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR go to clients to avoid clogging the channel.
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();
        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine.
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The broadcast channel exists before tracing so the log layer can use it.
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = rewind_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    let broadcast_layer = BroadcastLayer::new(broadcast_tx.clone());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(broadcast_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,rewind_daemon=debug")),
        )
        .init();

    info!("log file: {:?}", log_path);

    let config = Config::load()?;
    info!("config loaded from: {:?}", Config::config_path());

    std::fs::write(&config.daemon.pid_file, std::process::id().to_string())?;

    // Every external input funnels into the controller through this channel.
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<controller::DaemonEvent>(256);

    let controller = controller::PlaybackController::new(
        config.clone(),
        broadcast_tx.clone(),
        event_tx.clone(),
    )?;

    let state_manager = controller.state_manager();

    let _socket_handle = socket::start_server(
        config.control.bind_address.clone(),
        config.control.port,
        state_manager.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    // The proxy is always on; the player is pointed here for timeshift
    // playback.
    let _proxy_handle = proxy::start_server(
        "127.0.0.1".to_string(),
        config.proxy.port,
        controller.live_session(),
        config.buffer.clone(),
    );

    info!("daemon initialised, running event loop");
    controller.run(event_rx).await?;

    Ok(())
}
