use std::sync::Arc;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use log::{error, info, warn};
use serde::Serialize;
use tokio::io::{stdin, stdout, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::spawn;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::btle::BtleTransport;
use crate::device::transport::callback_channel;
use crate::device::types::Event;
use crate::error::{AppRunError, RouterError};
use crate::session::manager::{session_manager_task, SessionConfig};
use crate::session::relay::EventRelay;
use crate::session::router::{CommandRouter, RawCommand, RouterTargets};
use crate::Options;

/// Reply to one inbound command, correlated by its `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn new(id: Option<u64>, result: Result<(), RouterError>) -> Self {
        CommandResult {
            kind: "result",
            id,
            ok: result.is_ok(),
            error: result.err().map(|err| err.to_string()),
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin, T: Serialize>(out: &mut W, value: &T) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await
}

/// Serializes events and command results onto one output stream.
fn output_task<W: AsyncWrite + Unpin + Send + 'static>(
    mut out: W,
    mut events: UnboundedReceiver<Event>,
    mut results: UnboundedReceiver<CommandResult>,
) -> JoinHandle<std::io::Result<()>> {
    spawn(async move {
        loop {
            tokio::select! {
                Some(event) = events.next() => write_line(&mut out, &event).await?,
                Some(result) = results.next() => write_line(&mut out, &result).await?,
                else => break,
            }
        }
        Ok(())
    })
}

fn submit_line(
    router: &CommandRouter,
    results: &UnboundedSender<CommandResult>,
    pending: &mut JoinSet<()>,
    line: &str,
) {
    let raw: RawCommand = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(err) => {
            warn!("Could not parse command line: {}", err);
            let result = Err(RouterError::malformed(err.to_string()));
            let _ = results.unbounded_send(CommandResult::new(None, result));
            return;
        },
    };

    // connects and writes resolve late; keep reading lines meanwhile
    let router = router.clone();
    let results = results.clone();
    pending.spawn(async move {
        let id = raw.id;
        let result = router.submit(raw).await;
        if let Err(err) = &result {
            info!("Command {:?} failed: {}", id, err);
        }
        let _ = results.unbounded_send(CommandResult::new(id, result));
    });
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!("Command task failed: {:?}", err);
    }
}

/// Submits one command per input line until the input closes, then waits for
/// every submitted command to resolve.
async fn serve_commands<R: AsyncBufRead + Unpin>(
    input: R,
    router: &CommandRouter,
    results: &UnboundedSender<CommandResult>,
) -> std::io::Result<()> {
    let mut lines = input.lines();
    let mut pending = JoinSet::new();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        submit_line(router, results, &mut pending, line);
                    }
                },
                None => break,
            },
            Some(joined) = pending.join_next(), if !pending.is_empty() => reap(joined),
        }
    }

    if !pending.is_empty() {
        info!("Input closed, waiting for {} command(s)", pending.len());
    }
    while let Some(joined) = pending.join_next().await {
        reap(joined);
    }
    Ok(())
}

async fn load_config(config_io: &ConfigIO) -> Result<Config, AppRunError> {
    match config_io.read().await {
        Ok(config) => Ok(config),
        Err(err) if err.is_file_not_found_error() => {
            info!("Config file not found, using defaults");
            Ok(Config::default())
        },
        Err(err) => {
            error!("Failed to load config: {:?}", &err);
            Err(err.into())
        },
    }
}

pub async fn run_bridge(options: Options) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(options.config.clone())?;
    let mut locker = config_io.locker()?;
    let _lock = locker.lock()?;

    if options.write_default_config {
        config_io.save(&Config::default()).await?;
        info!("Wrote default config to {}", config_io.path().to_string_lossy());
        return Ok(());
    }

    let config = load_config(&config_io).await?;
    let targets = RouterTargets::try_from(&config)?;

    let cancel = CancellationToken::new();
    let relay = EventRelay::new(config.event_buffer_capacity);
    let (callbacks, transport_events) = callback_channel();
    let transport = BtleTransport::new(callbacks, cancel.child_token()).await?;

    let (session, session_task) = session_manager_task(
        cancel.child_token(),
        SessionConfig::from(&config),
        Arc::new(transport),
        transport_events,
        relay.clone(),
    );
    let router = CommandRouter::new(session, targets);

    let (event_sender, event_receiver) = unbounded::<Event>();
    let (result_sender, result_receiver) = unbounded::<CommandResult>();
    relay.attach(event_sender);
    let output_handle = output_task(stdout(), event_receiver, result_receiver);

    serve_commands(BufReader::new(stdin()), &router, &result_sender).await?;

    info!("Input closed, shutting down");
    cancel.cancel();
    relay.detach();
    drop(result_sender);
    drop(router);

    if let Err(err) = session_task.await {
        error!("Session manager task failed: {:?}", err);
    }
    match output_handle.await {
        Ok(result) => result?,
        Err(err) => error!("Output task failed: {:?}", err),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;
    use crate::device::transport::{Transport, TransportCallbacks};
    use crate::device::types::Command;
    use crate::error::{CommandError, DeviceError};

    /// Confirms connects a little later, like a real radio.
    struct SlowTransport {
        callbacks: TransportCallbacks,
    }

    impl Transport for SlowTransport {
        fn start_scan(&self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn stop_scan(&self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn connect(&self, name: &str) -> Result<(), DeviceError> {
            let callbacks = self.callbacks.clone();
            let name = name.to_string();
            spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                callbacks.did_connect(&name);
            });
            Ok(())
        }

        fn disconnect(&self, _name: &str) -> Result<(), DeviceError> {
            Ok(())
        }

        fn discover_services(&self, _name: &str) -> Result<(), DeviceError> {
            Ok(())
        }

        fn write_characteristic(&self, _name: &str, _id: u64, _uuid: Uuid, _value: &[u8]) -> Result<(), DeviceError> {
            Ok(())
        }

        fn read_characteristic(&self, _name: &str, _uuid: Uuid) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[test]
    fn results_serialize_with_type_discriminator() {
        let ok = serde_json::to_value(CommandResult::new(Some(3), Ok(()))).unwrap();
        assert_eq!(ok, serde_json::json!({"type": "result", "id": 3, "ok": true}));

        let rejected = CommandResult::new(None, Err(RouterError::from(CommandError::NotReady)));
        let value = serde_json::to_value(rejected).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"], "Command rejected: No device with discovered services is available");
    }

    #[tokio::test]
    async fn output_task_writes_json_lines() {
        let (event_sender, events) = unbounded();
        let (result_sender, results) = unbounded();
        let (writer, mut reader) = tokio::io::duplex(1024);

        let handle = output_task(writer, events, results);
        event_sender.unbounded_send(Event::DeviceDiscovered { name: "Pico-1".to_string(), rssi: -60 }).unwrap();
        drop(event_sender);
        drop(result_sender);
        handle.await.unwrap().unwrap();

        let mut output = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut output).await.unwrap();
        assert_eq!(output, "{\"type\":\"deviceDiscovered\",\"name\":\"Pico-1\",\"rssi\":-60}\n");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_input_waits_for_pending_connect() {
        let (callbacks, transport_events) = callback_channel();
        let transport = Arc::new(SlowTransport { callbacks: callbacks.clone() });
        let cancel = CancellationToken::new();
        let (session, _task) = session_manager_task(
            cancel.clone(),
            SessionConfig::default(),
            transport,
            transport_events,
            EventRelay::new(16),
        );

        session.dispatch(Command::StartScan).await.unwrap();
        callbacks.did_discover_device("Pico-1", -60);
        session.devices().await.unwrap();

        let router = CommandRouter::new(session, RouterTargets::try_from(&Config::default()).unwrap());
        let (result_sender, mut results) = unbounded();
        let input: &[u8] = b"{\"id\":7,\"method\":\"connectDevice\",\"arguments\":{\"name\":\"Pico-1\"}}\n\n";

        serve_commands(input, &router, &result_sender).await.unwrap();

        assert_eq!(results.try_next().unwrap(), Some(CommandResult::new(Some(7), Ok(()))));
        cancel.cancel();
    }

    #[tokio::test]
    async fn unparseable_line_gets_an_error_result() {
        let (callbacks, transport_events) = callback_channel();
        let transport = Arc::new(SlowTransport { callbacks });
        let cancel = CancellationToken::new();
        let (session, _task) = session_manager_task(
            cancel.clone(),
            SessionConfig::default(),
            transport,
            transport_events,
            EventRelay::new(16),
        );
        let router = CommandRouter::new(session, RouterTargets::try_from(&Config::default()).unwrap());
        let (result_sender, mut results) = unbounded();

        serve_commands(&b"not json\n"[..], &router, &result_sender).await.unwrap();

        let result = results.try_next().unwrap().unwrap();
        assert_eq!(result.id, None);
        assert!(!result.ok);
        cancel.cancel();
    }
}
