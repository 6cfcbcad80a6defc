//! The request/response envelope exchanged between engines.
//!
//! A [`Command`] carries its payloads as raw bytes; the bytes decode into
//! [`PayloadObject`]s. Bytes and objects are kept in sync: setting either
//! side regenerates the other. Empty bytes mean "no payload" and are never
//! an error, bytes that fail to decode leave the objects empty and are
//! logged.

use std::collections::HashMap;

use crate::{encoder, models::RunnerSnapshot, runner::JobRunner};

pub(crate) mod handle;
mod trace;


#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommandId(String);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Ping,
    /// Ships a whole runner, the response carries it back executed.
    JobRunner,
    RegisterWorker,
    DeregisterWorker,
    KillWorkers,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Ping => "ping",
            CommandKind::JobRunner => "job_runner",
            CommandKind::RegisterWorker => "register_worker",
            CommandKind::DeregisterWorker => "deregister_worker",
            CommandKind::KillWorkers => "kill_workers",
        }
    }

    /// Whether the receiver sends a response back.
    pub fn has_response(&self) -> bool {
        matches!(self, CommandKind::Ping | CommandKind::JobRunner)
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum PayloadObject {
    Runner(RunnerSnapshot),
    /// Address of a peer.
    Address(String),
    Text(String),
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(rename_all = "snake_case")]
pub struct Command {
    id: CommandId,
    kind: CommandKind,
    request: bool,

    request_payload: Vec<u8>,
    response_payload: Vec<u8>,

    /// Where the response goes.
    #[serde(default)]
    reply_to: Option<String>,

    /// Trace context of the sender.
    #[serde(default)]
    headers: HashMap<String, String>,

    #[serde(skip)]
    request_objects: Option<Vec<PayloadObject>>,
    #[serde(skip)]
    response_objects: Option<Vec<PayloadObject>>,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            id: CommandId(crate::generate_id()),
            kind,
            request: true,
            request_payload: Vec::new(),
            response_payload: Vec::new(),
            reply_to: None,
            headers: HashMap::new(),
            request_objects: None,
            response_objects: None,
        }
    }

    pub fn with_objects(kind: CommandKind, objects: Vec<PayloadObject>) -> Self {
        let mut command = Self::new(kind);
        command.set_request_objects(objects);
        command
    }

    /// A request carrying `runner` with all its jobs.
    pub fn job_runner(runner: &JobRunner) -> Self {
        Self::with_objects(
            CommandKind::JobRunner,
            vec![PayloadObject::Runner(runner.snapshot())],
        )
    }

    /// The response leg of this command: same id and kind, no payloads.
    pub fn respond(&self) -> Command {
        Self {
            id: self.id.clone(),
            kind: self.kind,
            request: false,
            request_payload: Vec::new(),
            response_payload: Vec::new(),
            reply_to: None,
            headers: HashMap::new(),
            request_objects: None,
            response_objects: None,
        }
    }

    pub fn id(&self) -> &CommandId {
        &self.id
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn is_request(&self) -> bool {
        self.request
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn set_reply_to(&mut self, address: impl Into<String>) {
        self.reply_to = Some(address.into());
    }

    pub fn request_payload(&self) -> &[u8] {
        &self.request_payload
    }

    pub fn set_request_payload(&mut self, payload: Vec<u8>) {
        self.request_objects = decode_objects(&payload, &self.id, "request");
        self.request_payload = payload;
    }

    pub fn request_objects(&self) -> Option<&[PayloadObject]> {
        self.request_objects.as_deref()
    }

    pub fn set_request_objects(&mut self, objects: Vec<PayloadObject>) {
        self.request_payload = encode_objects(&objects, &self.id, "request");
        self.request_objects = (!self.request_payload.is_empty()).then_some(objects);
    }

    pub fn response_payload(&self) -> &[u8] {
        &self.response_payload
    }

    pub fn set_response_payload(&mut self, payload: Vec<u8>) {
        self.response_objects = decode_objects(&payload, &self.id, "response");
        self.response_payload = payload;
    }

    pub fn response_objects(&self) -> Option<&[PayloadObject]> {
        self.response_objects.as_deref()
    }

    pub fn set_response_objects(&mut self, objects: Vec<PayloadObject>) {
        self.response_payload = encode_objects(&objects, &self.id, "response");
        self.response_objects = (!self.response_payload.is_empty()).then_some(objects);
    }

    /// Objects of the leg this command represents.
    pub fn payload_objects(&self) -> Option<&[PayloadObject]> {
        match self.request {
            true => self.request_objects(),
            false => self.response_objects(),
        }
    }

    pub fn runner(&self) -> Option<&RunnerSnapshot> {
        self.payload_objects()?.iter().find_map(|o| match o {
            PayloadObject::Runner(runner) => Some(runner),
            _ => None,
        })
    }

    pub fn address(&self) -> Option<&str> {
        self.payload_objects()?.iter().find_map(|o| match o {
            PayloadObject::Address(address) => Some(address.as_str()),
            _ => None,
        })
    }

    /// Validates the command before anything is done with it.
    pub fn check(&self) -> anyhow::Result<()> {
        let leg = if self.request { "request" } else { "response" };
        let payload = match self.request {
            true => &self.request_payload,
            false => &self.response_payload,
        };
        if !payload.is_empty() && self.payload_objects().is_none() {
            anyhow::bail!("{} {} {}: payload could not be decoded", self.kind, leg, self.id);
        }

        match (self.kind, self.request) {
            (CommandKind::JobRunner, _) => {
                if self.runner().is_none() {
                    anyhow::bail!("{} {} {}: no job runner in payload", self.kind, leg, self.id);
                }
            }
            (CommandKind::RegisterWorker, true) => {
                if self.address().is_none() {
                    anyhow::bail!("{} {}: no worker address in payload", self.kind, self.id);
                }
            }
            // an empty payload means there is nothing to deregister
            (CommandKind::DeregisterWorker, true) => {
                if self.payload_objects().is_some() && self.address().is_none() {
                    anyhow::bail!("{} {}: payload holds no worker address", self.kind, self.id);
                }
            }
            _ => {}
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        encoder::encode(self)
    }

    /// Decodes the envelope and rebuilds the payload objects of both legs.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Command> {
        let mut command = encoder::decode::<Command>(bytes)?;
        let request = std::mem::take(&mut command.request_payload);
        let response = std::mem::take(&mut command.response_payload);
        command.set_request_payload(request);
        command.set_response_payload(response);
        Ok(command)
    }
}

fn decode_objects(payload: &[u8], id: &CommandId, leg: &str) -> Option<Vec<PayloadObject>> {
    match encoder::decode_optional::<Vec<PayloadObject>>(payload) {
        Ok(Some(objects)) if !objects.is_empty() => Some(objects),
        Ok(_) => None,
        Err(e) => {
            tracing::error!("Command {}: failed to decode {} payload: {:#}", id, leg, e);
            None
        }
    }
}

fn encode_objects(objects: &[PayloadObject], id: &CommandId, leg: &str) -> Vec<u8> {
    if objects.is_empty() {
        return Vec::new();
    }

    match encoder::encode(objects) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("Command {}: failed to encode {} payload: {:#}", id, leg, e);
            Vec::new()
        }
    }
}
