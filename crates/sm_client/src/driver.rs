//! Tokio driver: owns the WebSocket, the heartbeat ticker and the reconnect
//! timer, and feeds everything through the engine.

use std::{collections::VecDeque, future::Future, ops::ControlFlow, pin::Pin};

use futures_util::{SinkExt, StreamExt};
use sm_proto::ChannelData;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant, Interval, MissedTickBehavior, Sleep},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::{
    engine::Engine,
    error::{ClientError, SendError},
    events::{ClientEvent, CloseInfo, Effect, Input, PeerSummary},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream, tungstenite::Error>> + Send>>;

const COMMAND_QUEUE: usize = 64;

enum Command {
    SetCredentials {
        username: String,
        room: String,
        password: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Connect {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Disconnect,
    SendChannelMessage {
        kind: String,
        data: ChannelData,
        reply: oneshot::Sender<Result<usize, SendError>>,
    },
    UpdateUsername {
        name: String,
        reply: oneshot::Sender<Result<usize, SendError>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerSummary>>,
    },
    ForgetRelayKey,
    Teardown,
}

/// Cheap, cloneable handle to a running client task.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<Command>,
}

impl ClientHandle {
    pub async fn set_credentials(
        &self,
        username: &str,
        room: &str,
        password: &str,
    ) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SetCredentials {
            username: username.to_string(),
            room: room.to_string(),
            password: password.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Connect { reply }).await?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.request(Command::Disconnect).await
    }

    pub async fn send_channel_message(
        &self,
        kind: &str,
        data: impl Into<ChannelData>,
    ) -> Result<usize, SendError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::SendChannelMessage {
                kind: kind.to_string(),
                data: data.into(),
                reply,
            })
            .await
            .map_err(|_| SendError::Stopped)?;
        rx.await.map_err(|_| SendError::Stopped)?
    }

    pub async fn update_username(&self, name: &str) -> Result<usize, SendError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::UpdateUsername {
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| SendError::Stopped)?;
        rx.await.map_err(|_| SendError::Stopped)?
    }

    pub async fn peers(&self) -> Result<Vec<PeerSummary>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Peers { reply }).await?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    pub async fn forget_relay_key(&self) -> Result<(), ClientError> {
        self.request(Command::ForgetRelayKey).await
    }

    /// Disconnect, forget credentials and stop the client task.
    pub async fn teardown(&self) -> Result<(), ClientError> {
        self.request(Command::Teardown).await
    }

    async fn request(&self, command: Command) -> Result<(), ClientError> {
        self.tx.send(command).await.map_err(|_| ClientError::Stopped)
    }
}

pub struct Client;

impl Client {
    /// Run `engine` on the current tokio runtime. Events arrive on the
    /// returned receiver until the task stops.
    pub fn spawn(
        engine: Engine,
    ) -> (
        ClientHandle,
        mpsc::UnboundedReceiver<ClientEvent>,
        JoinHandle<()>,
    ) {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (events, events_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            engine,
            commands,
            events,
            ws: None,
            pending: None,
            close_info: None,
            heartbeat: None,
            reconnect: None,
            inputs: VecDeque::new(),
        };
        let task = tokio::spawn(driver.run());
        (ClientHandle { tx }, events_rx, task)
    }
}

struct Driver {
    engine: Engine,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    ws: Option<WsStream>,
    pending: Option<ConnectFuture>,
    close_info: Option<CloseInfo>,
    heartbeat: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
    inputs: VecDeque<Input>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    // Dropping every handle tears the client down too.
                    let command = command.unwrap_or(Command::Teardown);
                    if self.on_command(command).is_break() {
                        self.pump().await;
                        if let Some(mut ws) = self.ws.take() {
                            let _ = ws.close(None).await;
                        }
                        debug!(op = "driver", "client task stopped");
                        break;
                    }
                },
                connected = finish_connect(&mut self.pending) => {
                    self.pending = None;
                    match connected {
                        Ok(ws) => {
                            self.ws = Some(ws);
                            self.close_info = None;
                            self.inputs.push_back(Input::TransportOpened);
                        }
                        Err(err) => {
                            self.inputs.push_back(Input::TransportError(err.to_string()));
                            self.inputs.push_back(Input::TransportClosed(CloseInfo::abnormal(err.to_string())));
                        }
                    }
                },
                frame = next_frame(&mut self.ws) => self.on_frame(frame),
                _ = tick(&mut self.heartbeat) => self.inputs.push_back(Input::HeartbeatTick),
                _ = wait(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.inputs.push_back(Input::ReconnectTimer);
                },
            }
            self.pump().await;
        }
    }

    /// Apply one command. `Break` means the task should stop.
    fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::SetCredentials {
                username,
                room,
                password,
                reply,
            } => {
                let _ = reply.send(self.engine.set_credentials(&username, &room, &password));
            }
            Command::Connect { reply } => {
                let _ = reply.send(self.engine.connect());
            }
            Command::Disconnect => self.engine.disconnect(),
            Command::SendChannelMessage { kind, data, reply } => {
                let _ = reply.send(self.engine.send_channel_message(&kind, data));
            }
            Command::UpdateUsername { name, reply } => {
                let _ = reply.send(self.engine.update_username(&name));
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.engine.peers());
            }
            Command::ForgetRelayKey => self.engine.forget_relay_key(),
            Command::Teardown => {
                self.engine.teardown();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn on_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.inputs.push_back(Input::Frame(text.to_string())),
            Some(Ok(Message::Close(frame))) => {
                self.close_info = Some(match frame {
                    Some(f) => CloseInfo::clean(u16::from(f.code), f.reason.to_string()),
                    None => CloseInfo::clean(1005, ""),
                });
            }
            Some(Ok(_)) => {}
            Some(Err(tungstenite::Error::ConnectionClosed)) | None => self.transport_gone(None),
            Some(Err(err)) => self.transport_gone(Some(err.to_string())),
        }
    }

    fn transport_gone(&mut self, error: Option<String>) {
        self.ws = None;
        let info = self
            .close_info
            .take()
            .unwrap_or_else(|| CloseInfo::abnormal(error.clone().unwrap_or_default()));
        if let Some(err) = error {
            self.inputs.push_back(Input::TransportError(err));
        }
        self.inputs.push_back(Input::TransportClosed(info));
    }

    /// Carry out queued effects and feed follow-up inputs until both queues
    /// are empty.
    async fn pump(&mut self) {
        loop {
            let effects = self.engine.take_effects();
            if !effects.is_empty() {
                for effect in effects {
                    self.apply(effect).await;
                }
                continue;
            }
            match self.inputs.pop_front() {
                Some(input) => {
                    for effect in self.engine.handle(input) {
                        self.apply(effect).await;
                    }
                }
                None => break,
            }
        }
    }

    async fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::OpenTransport { url } => {
                self.ws = None;
                self.close_info = None;
                self.pending = Some(Box::pin(async move {
                    connect_async(url).await.map(|(ws, _response)| ws)
                }));
            }
            Effect::Send(text) => {
                if let Some(ws) = self.ws.as_mut() {
                    if let Err(err) = ws.send(Message::Text(text.into())).await {
                        warn!(op = "send", error = %err, "websocket send failed");
                    }
                }
            }
            Effect::CloseTransport => {
                if let Some(ws) = self.ws.as_mut() {
                    if let Err(err) = ws.close(None).await {
                        debug!(op = "close", error = %err, "close handshake failed");
                        self.transport_gone(None);
                    }
                } else if self.pending.take().is_some() {
                    self.inputs
                        .push_back(Input::TransportClosed(CloseInfo::abnormal("connect aborted")));
                }
            }
            Effect::StartHeartbeat { interval } => {
                let mut ticker = time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(ticker);
            }
            Effect::StopHeartbeat => self.heartbeat = None,
            Effect::ScheduleReconnect { delay, attempt } => {
                debug!(op = "reconnect", attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                self.reconnect = Some(Box::pin(time::sleep(delay)));
            }
            Effect::CancelReconnect => self.reconnect = None,
            Effect::Emit(event) => {
                if self.events.send(event).is_err() {
                    debug!(op = "event", "event receiver dropped");
                }
            }
        }
    }
}

async fn finish_connect(pending: &mut Option<ConnectFuture>) -> Result<WsStream, tungstenite::Error> {
    match pending {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_frame(ws: &mut Option<WsStream>) -> Option<Result<Message, tungstenite::Error>> {
    match ws {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait(reconnect: &mut Option<Pin<Box<Sleep>>>) {
    match reconnect {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
