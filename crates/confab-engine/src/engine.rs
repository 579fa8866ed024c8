//! The conversation engine: a single-task state machine fed by send
//! streams, the long-poll loop, and caller commands.
//!
//! Every mutation of the conversation and every observer callback happens on
//! one spawned task. Send streams and the poll loop run as pump tasks that
//! post decoded events back into the engine's mailbox, so interleaving
//! between the two producers is resolved purely by arrival order.

use crate::config::EngineConfig;
use crate::conversation::{
    Conversation, HandOffState, HumanAgentParticipation, Message, TYPING_PLACEHOLDER, Transfer,
};
use crate::error::{Error, GENERIC_ERROR, Result, user_message_for};
use crate::observer::{ChatObserver, ObserverSet};
use crate::poll;
use confab_wire::{
    Attachment, ChatEvent, ChatTransport, HttpChatTransport, PollRequest, Role, SendRequest,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Work posted into the engine mailbox, by callers and by pump tasks.
pub(crate) enum EngineMsg {
    SendText(String),
    EndChat,
    CancelSend,
    AddObserver(Weak<dyn ChatObserver>),
    RemoveObserver(Weak<dyn ChatObserver>),
    Snapshot(oneshot::Sender<Conversation>),
    /// Event from the in-flight user send stream.
    SendUpdate(ChatEvent),
    /// The user send stream terminated; `None` means normal completion.
    SendClosed(Option<confab_wire::Error>),
    /// Event from the silent end-of-conversation send.
    SilentUpdate(ChatEvent),
    SilentClosed,
    /// Event from the long-poll loop.
    PollUpdate(ChatEvent),
}

/// Cloneable handle to the conversation engine.
///
/// The handle only posts work into the engine task's mailbox. Dropping the
/// last handle shuts the engine down, cancelling any in-flight send and the
/// poll loop.
#[derive(Clone)]
pub struct ChatEngine {
    tx: mpsc::UnboundedSender<EngineMsg>,
}

impl ChatEngine {
    /// Spawn an engine over the given transport.
    pub fn spawn(config: EngineConfig, transport: Arc<dyn ChatTransport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = EngineTask {
            config,
            transport,
            mailbox: tx.downgrade(),
            conversation: Conversation::default(),
            observers: ObserverSet::default(),
            send_in_flight: false,
            silent_in_flight: false,
            send_cancel: None,
            send_slot: None,
            poll_slot: None,
            poll: None,
            closing_send_done: false,
        };
        tokio::spawn(task.run(rx));
        Self { tx }
    }

    /// Spawn an engine over an HTTP transport for `base_url`.
    pub fn connect(base_url: impl Into<String>, config: EngineConfig) -> Self {
        let transport = HttpChatTransport::with_generation(base_url, config.generation);
        Self::spawn(config, Arc::new(transport))
    }

    /// Send a user message. Dropped with a warning while sending is
    /// disabled; watch [`ChatObserver::can_send_changed`] to gate input.
    pub fn send_message(&self, text: impl Into<String>) {
        self.post(EngineMsg::SendText(text.into()));
    }

    /// Ask the service to end the conversation and deliver its closing
    /// message.
    pub fn end_conversation(&self) {
        self.post(EngineMsg::EndChat);
    }

    /// Cancel the in-flight send, if any. No further message or error
    /// notifications are delivered for it.
    pub fn cancel_send(&self) {
        self.post(EngineMsg::CancelSend);
    }

    /// Register an observer. The engine keeps only a weak handle: drop the
    /// `Arc` or call [`ChatEngine::remove_observer`] to stop notifications.
    pub fn add_observer(&self, observer: &Arc<dyn ChatObserver>) {
        self.post(EngineMsg::AddObserver(Arc::downgrade(observer)));
    }

    /// Unregister an observer previously passed to
    /// [`ChatEngine::add_observer`].
    pub fn remove_observer(&self, observer: &Arc<dyn ChatObserver>) {
        self.post(EngineMsg::RemoveObserver(Arc::downgrade(observer)));
    }

    /// Snapshot of the conversation, ordered after everything already
    /// posted to the engine.
    pub async fn conversation(&self) -> Result<Conversation> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineMsg::Snapshot(reply_tx))
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)
    }

    fn post(&self, msg: EngineMsg) {
        if self.tx.send(msg).is_err() {
            tracing::warn!("engine task is gone, command dropped");
        }
    }
}

/// Which production context a placeholder slot belongs to. The send stream
/// and the poll loop each manage their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Send,
    Poll,
}

struct PollHandle {
    cancel: CancellationToken,
    params: watch::Sender<PollRequest>,
}

struct EngineTask {
    config: EngineConfig,
    transport: Arc<dyn ChatTransport>,
    mailbox: mpsc::WeakUnboundedSender<EngineMsg>,
    conversation: Conversation,
    observers: ObserverSet,
    send_in_flight: bool,
    silent_in_flight: bool,
    send_cancel: Option<CancellationToken>,
    send_slot: Option<Uuid>,
    poll_slot: Option<Uuid>,
    poll: Option<PollHandle>,
    closing_send_done: bool,
}

impl EngineTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineMsg>) {
        while let Some(msg) = rx.recv().await {
            self.handle(msg);
        }
        if let Some(cancel) = self.send_cancel.take() {
            cancel.cancel();
        }
        if let Some(poll) = self.poll.take() {
            poll.cancel.cancel();
        }
    }

    fn handle(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::SendText(text) => self.start_send(text),
            EngineMsg::EndChat => self.start_end_chat(),
            EngineMsg::CancelSend => self.cancel_send(),
            EngineMsg::AddObserver(observer) => {
                self.observers.add(observer);
                self.sync_poll_loop();
            }
            EngineMsg::RemoveObserver(observer) => {
                self.observers.remove(&observer);
                self.sync_poll_loop();
            }
            EngineMsg::Snapshot(reply) => {
                let _ = reply.send(self.conversation.clone());
            }
            // Stale stream messages arriving after cancellation are dropped
            // by the in-flight guards.
            EngineMsg::SendUpdate(event) if self.send_in_flight => self.on_send_event(event),
            EngineMsg::SendClosed(error) if self.send_in_flight => self.on_send_closed(error),
            EngineMsg::SilentUpdate(event) if self.silent_in_flight => self.on_silent_event(event),
            EngineMsg::SilentClosed if self.silent_in_flight => self.on_silent_closed(),
            EngineMsg::PollUpdate(event) => self.on_poll_event(event),
            _ => {}
        }
    }

    // ---- Sending ----

    fn start_send(&mut self, text: String) {
        if !self.conversation.can_send || self.send_in_flight {
            tracing::warn!("send ignored while sending is disabled");
            return;
        }
        self.append_message(Message::new(Role::User, text.clone()));
        self.send_in_flight = true;
        self.update_can_send();

        // The reply arrives on this stream unless a hand-off is active, in
        // which case it comes through the poll loop instead.
        if self.conversation.participation.is_none() {
            self.open_placeholder(Slot::Send, Role::Assistant);
        } else {
            self.send_slot = None;
        }

        let request = self.send_request(Some(text), false);
        self.spawn_send_pump(request, false);
    }

    fn start_end_chat(&mut self) {
        if self.conversation.ended || self.send_in_flight {
            return;
        }
        // The explicit end request retrieves the closing message itself, so
        // the automatic follow-up is already satisfied.
        self.closing_send_done = true;
        self.send_in_flight = true;
        self.update_can_send();
        self.send_slot = None;
        let request = self.send_request(None, true);
        self.spawn_send_pump(request, false);
    }

    fn cancel_send(&mut self) {
        let Some(cancel) = self.send_cancel.take() else {
            return;
        };
        cancel.cancel();
        if self.send_in_flight {
            self.send_in_flight = false;
            self.close_slot(Slot::Send);
            self.update_can_send();
        }
    }

    fn send_request(&self, message: Option<String>, end_conversation: bool) -> SendRequest {
        SendRequest {
            token: self.config.token.clone(),
            message,
            state: self.conversation.state.clone(),
            variables: self.config.variables.clone(),
            secrets: self.config.secrets.clone(),
            locale: self.config.locale.clone(),
            custom_greeting: self.config.custom_greeting.clone(),
            contact_center: self.config.contact_center,
            polling: self.conversation.participation.is_some(),
            end_conversation,
            conversation_id: self.conversation.conversation_id.clone(),
        }
    }

    fn poll_request(&self) -> PollRequest {
        PollRequest {
            token: self.config.token.clone(),
            state: self.conversation.state.clone(),
            variables: self.config.variables.clone(),
            secrets: self.config.secrets.clone(),
            cursor: self.conversation.cursor.clone(),
        }
    }

    fn spawn_send_pump(&mut self, request: SendRequest, silent: bool) {
        let cancel = CancellationToken::new();
        if silent {
            self.silent_in_flight = true;
        } else {
            self.send_cancel = Some(cancel.clone());
        }
        let transport = Arc::clone(&self.transport);
        let mailbox = self.mailbox.clone();

        let post = move |msg: EngineMsg| -> bool {
            match mailbox.upgrade() {
                Some(tx) => tx.send(msg).is_ok(),
                None => false,
            }
        };
        let closed = move |error: Option<confab_wire::Error>| -> EngineMsg {
            if silent {
                EngineMsg::SilentClosed
            } else {
                EngineMsg::SendClosed(error)
            }
        };

        tokio::spawn(async move {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                opened = transport.send(request, cancel.clone()) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    post(closed(Some(e)));
                    return;
                }
            };
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(event)) => {
                        let msg = if silent {
                            EngineMsg::SilentUpdate(event)
                        } else {
                            EngineMsg::SendUpdate(event)
                        };
                        if !post(msg) {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        post(closed(Some(e)));
                        return;
                    }
                    None => {
                        post(closed(None));
                        return;
                    }
                }
            }
        });
    }

    // ---- Send-stream transitions ----

    fn on_send_event(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::State { state } => self.replace_state(state),
            ChatEvent::Message {
                role,
                text,
                attachments,
                is_end_of_message,
                preparing_followup,
            } => self.apply_message(
                Slot::Send,
                role,
                text,
                attachments,
                is_end_of_message,
                preparing_followup,
            ),
            ChatEvent::Transfer {
                is_synchronous,
                is_contact_center,
                data,
            } => self.apply_transfer(
                is_synchronous.unwrap_or(false),
                is_contact_center.unwrap_or(false),
                data,
            ),
            ChatEvent::EndConversation => {
                self.close_slot(Slot::Send);
                self.set_ended();
            }
            ChatEvent::Error {
                user_visible_message,
            } => {
                self.close_slot(Slot::Send);
                let text = user_visible_message.unwrap_or_else(|| GENERIC_ERROR.to_string());
                self.notify(|o| o.error(&text));
            }
            ChatEvent::LegacyConversationId { conversation_id } => {
                self.conversation.conversation_id = Some(conversation_id);
            }
            ChatEvent::LegacyEncryptionKey { encryption_key } => {
                self.conversation.encryption_key = Some(encryption_key);
            }
            other => {
                tracing::debug!(?other, "update not applicable to a send stream, ignoring");
            }
        }
    }

    fn on_send_closed(&mut self, error: Option<confab_wire::Error>) {
        self.send_in_flight = false;
        self.send_cancel = None;
        // A slot that never got content cannot fill once its session is
        // gone.
        self.close_slot(Slot::Send);
        if let Some(e) = error {
            if !e.is_aborted() {
                tracing::warn!(error = %e, "send stream failed");
                let text = user_message_for(&e);
                self.notify(|o| o.error(text));
            }
        }
        self.update_can_send();
    }

    // ---- Silent end-of-conversation follow-up ----

    fn on_silent_event(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::State { state } => self.replace_state(state),
            ChatEvent::Message {
                role,
                text,
                attachments,
                is_end_of_message,
                preparing_followup,
            } => self.apply_message(
                Slot::Send,
                role,
                text,
                attachments,
                is_end_of_message,
                preparing_followup,
            ),
            other => {
                tracing::debug!(?other, "update ignored on the closing stream");
            }
        }
    }

    fn on_silent_closed(&mut self) {
        self.silent_in_flight = false;
        self.close_slot(Slot::Send);
    }

    // ---- Poll-stream transitions ----

    fn on_poll_event(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::LivePollCursor { cursor } => {
                self.conversation.cursor = Some(cursor);
                self.refresh_poll_params();
            }
            ChatEvent::Message {
                role,
                text,
                attachments,
                is_end_of_message,
                preparing_followup,
            } => self.apply_message(
                Slot::Poll,
                role,
                text,
                attachments,
                is_end_of_message,
                preparing_followup,
            ),
            ChatEvent::State { state } => self.replace_state(state),
            ChatEvent::HumanAgentInfo {
                queue_size,
                display_name,
                joined,
                left,
                typing,
            } => self.apply_human_agent_info(queue_size, display_name, joined, left, typing),
            ChatEvent::EndConversation => {
                self.close_slot(Slot::Poll);
                self.set_ended();
            }
            other => {
                tracing::debug!(?other, "update not applicable to the poll stream, ignoring");
            }
        }
    }

    fn apply_human_agent_info(
        &mut self,
        queue_size: Option<u32>,
        display_name: Option<String>,
        joined: Option<bool>,
        left: Option<bool>,
        typing: Option<bool>,
    ) {
        {
            let participation = self
                .conversation
                .participation
                .get_or_insert_with(HumanAgentParticipation::waiting);
            if let Some(size) = queue_size {
                participation.queue_size = Some(size);
            }
            if let Some(name) = display_name {
                participation.display_name = Some(name);
            }
            if joined == Some(true) {
                participation.state = HandOffState::Joined;
            }
            if left == Some(true) {
                participation.state = HandOffState::Left;
            }
        }
        if left == Some(true) {
            self.close_slot(Slot::Poll);
        } else if typing == Some(true) && self.poll_slot.is_none() {
            self.open_placeholder(Slot::Poll, Role::HumanAgent);
        }
        self.update_can_send();
        self.notify_participation();
    }

    // ---- Shared transitions ----

    /// Message assembly for one production context. Non-matching roles are
    /// ignored; content opens the slot's placeholder on demand, replaces its
    /// marker with the first text delta, and appends afterwards.
    fn apply_message(
        &mut self,
        slot: Slot,
        role: Role,
        text: Option<String>,
        attachments: Vec<Attachment>,
        is_end_of_message: Option<bool>,
        preparing_followup: Option<bool>,
    ) {
        let expected = match slot {
            Slot::Send => Role::Assistant,
            Slot::Poll => Role::HumanAgent,
        };
        if role != expected {
            tracing::debug!(?role, ?expected, "message for another role, ignoring");
            return;
        }

        let has_content = text.as_ref().is_some_and(|t| !t.is_empty()) || !attachments.is_empty();
        if has_content {
            let id = match self.slot(slot) {
                Some(id) => id,
                None => self.open_placeholder(slot, expected),
            };
            if let Some(message) = self.conversation.message_mut(id) {
                if let Some(text) = text {
                    if message.text == TYPING_PLACEHOLDER {
                        message.text = text;
                    } else {
                        message.text.push_str(&text);
                    }
                }
                message.attachments.extend(attachments);
                let changed = message.clone();
                self.notify(|o| o.message_changed(&changed));
            }
        }

        if is_end_of_message == Some(true) {
            self.set_slot(slot, None);
        }
        // The server announces more output; reopen eagerly so the typing
        // indicator shows. An already-open slot keeps receiving instead.
        if preparing_followup == Some(true) && self.slot(slot).is_none() {
            self.open_placeholder(slot, expected);
        }
    }

    fn apply_transfer(
        &mut self,
        is_synchronous: bool,
        is_contact_center: bool,
        data: HashMap<String, String>,
    ) {
        self.close_slot(Slot::Send);
        if is_synchronous {
            self.conversation.synchronously_transferred = true;
        }
        if (is_synchronous || is_contact_center) && self.conversation.participation.is_none() {
            // Hand-off begins: a human agent picks the conversation up
            // through the poll loop.
            self.conversation.participation = Some(HumanAgentParticipation::waiting());
            self.notify_participation();
            self.sync_poll_loop();
        }
        self.update_can_send();
        let transfer = Transfer {
            is_synchronous,
            is_contact_center,
            data,
        };
        self.notify(|o| o.transfer(&transfer));
    }

    fn set_ended(&mut self) {
        if self.conversation.ended {
            return;
        }
        self.conversation.ended = true;
        self.update_can_send();
        self.notify(|o| o.conversation_ended());
        self.sync_poll_loop();
        if !self.closing_send_done {
            self.closing_send_done = true;
            // One silent send fetches the closing message; its failures are
            // swallowed because the user never initiated it.
            let request = self.send_request(None, true);
            self.spawn_send_pump(request, true);
        }
    }

    fn replace_state(&mut self, state: serde_json::Value) {
        self.conversation.state = Some(state);
        self.refresh_poll_params();
    }

    // ---- Placeholder slots ----

    fn slot(&self, slot: Slot) -> Option<Uuid> {
        match slot {
            Slot::Send => self.send_slot,
            Slot::Poll => self.poll_slot,
        }
    }

    fn set_slot(&mut self, slot: Slot, value: Option<Uuid>) {
        match slot {
            Slot::Send => self.send_slot = value,
            Slot::Poll => self.poll_slot = value,
        }
    }

    fn open_placeholder(&mut self, slot: Slot, role: Role) -> Uuid {
        let message = Message::placeholder(role);
        let id = message.id;
        self.append_message(message);
        self.set_slot(slot, Some(id));
        id
    }

    /// Close a slot; a still-bare placeholder is removed, it will never
    /// fill.
    fn close_slot(&mut self, slot: Slot) {
        let Some(id) = self.slot(slot) else {
            return;
        };
        self.set_slot(slot, None);
        if self
            .conversation
            .message(id)
            .is_some_and(Message::is_placeholder)
        {
            self.conversation.remove_message(id);
            self.notify(|o| o.message_removed(id));
        }
    }

    fn append_message(&mut self, message: Message) {
        self.conversation.messages.push(message.clone());
        self.notify(|o| o.message_added(&message));
    }

    // ---- Gating and supervision ----

    fn update_can_send(&mut self) {
        let gated = self.send_in_flight
            || self.conversation.ended
            || match &self.conversation.participation {
                Some(p) => match p.state {
                    HandOffState::Left => true,
                    HandOffState::Joined => false,
                    HandOffState::Waiting => self.conversation.synchronously_transferred,
                },
                None => self.conversation.synchronously_transferred,
            };
        let can_send = !gated;
        if can_send != self.conversation.can_send {
            self.conversation.can_send = can_send;
            self.notify(|o| o.can_send_changed(can_send));
        }
    }

    /// Start or stop the poll loop to match its activation condition:
    /// participation present, at least one live observer, conversation not
    /// ended. Once the conversation ends the loop never restarts.
    fn sync_poll_loop(&mut self) {
        let should_run = self.conversation.participation.is_some()
            && !self.conversation.ended
            && self.observers.live_count() > 0;
        match (&self.poll, should_run) {
            (None, true) => {
                let cancel = CancellationToken::new();
                let (params_tx, params_rx) = watch::channel(self.poll_request());
                tokio::spawn(poll::run(
                    Arc::clone(&self.transport),
                    params_rx,
                    self.mailbox.clone(),
                    cancel.clone(),
                    self.config.backoff.clone(),
                ));
                self.poll = Some(PollHandle {
                    cancel,
                    params: params_tx,
                });
                tracing::debug!("poll loop started");
            }
            (Some(_), false) => {
                if let Some(poll) = self.poll.take() {
                    poll.cancel.cancel();
                }
                self.close_slot(Slot::Poll);
                tracing::debug!("poll loop stopped");
            }
            _ => {}
        }
    }

    fn refresh_poll_params(&self) {
        if let Some(poll) = &self.poll {
            let _ = poll.params.send(self.poll_request());
        }
    }

    // ---- Notification fan-out ----

    fn notify(&mut self, f: impl Fn(&dyn ChatObserver)) {
        self.observers.notify(f);
    }

    fn notify_participation(&mut self) {
        let participation = self.conversation.participation.clone();
        self.notify(|o| o.participation_changed(participation.as_ref()));
    }
}
