//! Per-session decoder engine and worker.
//!
//! A [DecoderEngine] owns every piece of mutable per-session state: the
//! reassembly buffer, the address registry, the key table, and the counter
//! tables. It is driven either directly through [DecoderEngine::handle_chunk]
//! or by a dedicated worker thread ([spawn_session]) that pulls chunks from a
//! crossbeam channel and pushes rendered records to the log and UI sinks.
//!
//! The engine has a single writer: only the session worker touches its state,
//! so no locks guard it. Cross-thread handoff happens exclusively at the
//! chunk-intake and record-output channel boundaries.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

use crate::classify::{subtype_label, DecodeOutcome, DecodedRecord, SVC_NUMBER_ASSIGN};
use crate::crypto::{CipherOutcome, Direction, KeyState, KeyTable, Sync, MASTER_KEY};
use crate::framing::Reassembler;
use crate::header::{Header, KeyKind, PacketType};
use crate::registry::{display_mac, AddressRegistry, Counters, Mac, MASTER_ADDRESS};
use crate::session::{self, DataExchange, Session};
use crate::{Error, Result};

/// How long the worker blocks on the intake queue before re-checking the
/// stop flag.
const RECV_TIMEOUT: Duration = Duration::from_millis(200);
/// Outbound record buffering; a full sink drops records rather than stalling
/// the decoder.
const OUTBOUND_BUFFER: usize = 4096;
/// Fixed packet size (in characters) for the hex and binary pass-through
/// encodings.
const PASSTHROUGH_PACKET_LEN: usize = 150;
/// Force-cut length for ASCII pass-through lines with no newline in sight.
const ASCII_LINE_MAX: usize = 200;

/// Stream interpretation for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Full Orion2 protocol decode.
    Orion2,
    /// Raw hex dump, fixed-size chunking only.
    Hex,
    /// Binary-string dump, fixed-size chunking only.
    Bin,
    /// ASCII lines, split on newline.
    Ascii,
}

/// Session options.
#[derive(TypedBuilder, Debug, Clone)]
pub struct SessionConfig {
    #[builder(default = Encoding::Orion2)]
    pub encoding: Encoding,
    /// Count idle/search/get-id/give-addr chatter and drop it from the
    /// output. When false the frames are still counted but forwarded with
    /// minimal annotation.
    #[builder(default = true)]
    pub suppress_idle: bool,
    /// Hex substring whose occurrences are counted per address and stripped
    /// from forwarded payload text.
    #[builder(default)]
    pub filter: Option<String>,
    /// Keep learned keys, counters, and addresses when the session stops, so
    /// a quick reconnect does not have to re-learn them.
    #[builder(default = true)]
    pub retain_state: bool,
    #[builder(default = MASTER_KEY)]
    pub master_key: [u8; 16],
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.6f").to_string()
}

/// Decoder for one bus session.
pub struct DecoderEngine {
    config: SessionConfig,
    reassembler: Reassembler,
    registry: AddressRegistry,
    keys: KeyTable,
    counters: Counters,
    /// Pass-through remainder carried between chunks.
    carry: String,
}

impl DecoderEngine {
    /// Create an engine for the given configuration.
    ///
    /// # Errors
    /// [Error::Config] if the filter pattern contains non-hex characters.
    pub fn new(config: SessionConfig) -> Result<Self> {
        if let Some(pat) = &config.filter {
            if !pat.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::Config(format!("filter is not a hex string: {pat:?}")));
            }
        }
        Ok(DecoderEngine {
            keys: KeyTable::new(config.master_key),
            config,
            reassembler: Reassembler::new(),
            registry: AddressRegistry::new(),
            counters: Counters::new(),
            carry: String::new(),
        })
    }

    #[must_use]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    #[must_use]
    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    #[must_use]
    pub fn key_state(&self, address: u8) -> &KeyState {
        self.keys.state(address)
    }

    /// Process one inbound chunk, returning the records it produced.
    ///
    /// Frames are handled strictly in arrival order; key and registry
    /// mutations are applied in the same order the bus delivered them.
    pub fn handle_chunk(&mut self, chunk: &[u8]) -> Vec<DecodedRecord> {
        match self.config.encoding {
            Encoding::Orion2 => {
                self.reassembler.extend(chunk);
                let mut records = Vec::new();
                while let Some(frame) = self.reassembler.next_frame() {
                    if let Some(rec) = self.process_frame(&frame) {
                        records.push(rec);
                    }
                }
                records
            }
            Encoding::Hex => self.passthrough(&hex::encode(chunk)),
            Encoding::Bin => {
                let text: String = chunk.iter().map(|b| format!("{b:08b}")).collect();
                self.passthrough(&text)
            }
            Encoding::Ascii => self.passthrough_ascii(chunk),
        }
    }

    /// End the session: the partial frame buffer and pass-through carry are
    /// always discarded; learned state survives only with
    /// [SessionConfig::retain_state].
    pub fn finish_session(&mut self) {
        self.reassembler.clear();
        self.carry.clear();
        if !self.config.retain_state {
            self.registry.clear();
            self.keys.clear();
            self.counters.clear();
        }
    }

    fn passthrough(&mut self, text: &str) -> Vec<DecodedRecord> {
        self.carry.push_str(text);
        let mut out = Vec::new();
        while self.carry.len() > PASSTHROUGH_PACKET_LEN {
            let rest = self.carry.split_off(PASSTHROUGH_PACKET_LEN);
            let packet = std::mem::replace(&mut self.carry, rest);
            out.push(DecodedRecord::raw(timestamp(), packet));
        }
        out
    }

    fn passthrough_ascii(&mut self, chunk: &[u8]) -> Vec<DecodedRecord> {
        self.carry
            .extend(chunk.iter().filter(|b| b.is_ascii()).map(|&b| b as char));
        let mut out = Vec::new();
        loop {
            match self.carry.find('\n') {
                Some(0) => {
                    self.carry.remove(0);
                }
                Some(end) => {
                    let rest = self.carry.split_off(end + 1);
                    let mut line = std::mem::replace(&mut self.carry, rest);
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                    if !line.is_empty() {
                        out.push(DecodedRecord::raw(timestamp(), line));
                    }
                }
                None => {
                    if self.carry.len() > ASCII_LINE_MAX {
                        let rest = self.carry.split_off(ASCII_LINE_MAX);
                        let packet = std::mem::replace(&mut self.carry, rest);
                        out.push(DecodedRecord::raw(timestamp(), packet));
                    } else {
                        break;
                    }
                }
            }
        }
        out
    }

    fn process_frame(&mut self, frame: &[u8]) -> Option<DecodedRecord> {
        let address = (frame.get(1).copied().unwrap_or(0) & 0x1f) as usize;
        match session::classify(frame) {
            Session::IdleAck => {
                self.counters.idle_ack[address] += 1;
                self.suppressed(frame, "IDLE+ACK")
            }
            Session::Search => {
                self.counters.search[address] += 1;
                self.suppressed(frame, "SEARCH")
            }
            Session::GetId => {
                self.counters.get_id[address] += 1;
                self.suppressed(frame, "GETID")
            }
            Session::GiveAddr(g) => {
                debug!(
                    address = g.address,
                    mac = display_mac(&g.device_mac),
                    "address assigned"
                );
                self.registry.record(g.address, g.device_mac);
                self.registry.record(MASTER_ADDRESS, g.master_mac);
                self.suppressed(frame, "GIVEADDR")
            }
            Session::IdleRequest => {
                let mut rec = DecodedRecord::raw(timestamp(), hex::encode(frame));
                rec.type_flags = "REQACK".to_string();
                Some(rec)
            }
            Session::Unrecognized => Some(DecodedRecord::raw(timestamp(), hex::encode(frame))),
            Session::Data(d) => Some(self.decode_data(frame, address as u8, d)),
        }
    }

    fn suppressed(&self, frame: &[u8], label: &str) -> Option<DecodedRecord> {
        if self.config.suppress_idle {
            return None;
        }
        let mut rec = DecodedRecord::raw(timestamp(), hex::encode(frame));
        rec.type_flags = label.to_string();
        Some(rec)
    }

    fn decode_data(&mut self, frame: &[u8], address: u8, d: DataExchange) -> DecodedRecord {
        let mut rec = DecodedRecord::raw(timestamp(), hex::encode(frame));
        let session_label = if d.request_triggered {
            format!("REQACK+{}", d.channel.label(d.acked))
        } else {
            d.channel.label(d.acked).to_string()
        };

        if !d.acked {
            rec.type_flags = session_label;
            rec.content = DecodeOutcome::LostAck.render();
            return rec;
        }

        let Some(hdr) = Header::decode(&d.body) else {
            rec.type_flags = session_label;
            rec.content = DecodeOutcome::Malformed("truncated header".to_string()).render();
            return rec;
        };

        rec.length_info = format!("{}/{}", hdr.length, d.body.len());
        rec.sequence = hdr.sequence.to_string();
        rec.type_flags = format!("{session_label} {}", hdr.label());

        if hdr.length as usize != d.body.len() {
            rec.content = DecodeOutcome::Malformed(format!(
                "declared length {} but body is {} bytes",
                hdr.length,
                d.body.len()
            ))
            .render();
            return rec;
        }

        let (payload, endpoints) = self.strip_macs(&d.body[Header::LEN..]);
        match endpoints.as_slice() {
            [only] => rec.direction = display_mac(only),
            [src, dst] => {
                rec.direction = format!("{} > {}", display_mac(src), display_mac(dst));
            }
            _ => {}
        }

        let mut resynced = false;
        let outcome = if !hdr.flags.encrypted {
            self.maybe_seed_counter(address, hdr.packet_type, &payload);
            DecodeOutcome::NotEncrypted
        } else {
            match endpoints.as_slice() {
                [src, dst] => {
                    let direction = if self.registry.get(address) == Some(dst) {
                        Direction::In
                    } else {
                        Direction::Out
                    };
                    let zult = match hdr.flags.key_kind {
                        KeyKind::Master => self.keys.decrypt_master(
                            address,
                            direction,
                            src,
                            dst,
                            hdr.sequence,
                            &payload,
                        ),
                        KeyKind::Work => self.keys.decrypt_work(
                            address,
                            direction,
                            src,
                            dst,
                            hdr.sequence,
                            &payload,
                        ),
                    };
                    match zult {
                        CipherOutcome::Plaintext { data, sync } => {
                            resynced = sync == Sync::Forced;
                            self.maybe_seed_counter(address, hdr.packet_type, &data);
                            DecodeOutcome::Decoded(self.classify_content(
                                address,
                                hdr.packet_type,
                                &data,
                            ))
                        }
                        CipherOutcome::MissingMasterCounter => DecodeOutcome::MissingMasterCounter,
                        CipherOutcome::MissingWorkKey => DecodeOutcome::MissingWorkKey,
                    }
                }
                // Without both endpoint MACs there is no IV to decrypt with.
                _ => match hdr.flags.key_kind {
                    KeyKind::Master => DecodeOutcome::MissingMasterCounter,
                    KeyKind::Work => DecodeOutcome::MissingWorkKey,
                },
            }
        };

        rec.content = match &outcome {
            DecodeOutcome::NotEncrypted => format!(
                "not encrypted; {}",
                self.classify_content(address, hdr.packet_type, &payload)
            ),
            other => other.render(),
        };
        if resynced {
            rec.content
                .push_str(" [counter resynchronized; verify decryption]");
        }
        rec
    }

    /// Scan the payload for registered MACs; the first two non-overlapping
    /// matches in byte order are taken as the endpoint fields and stripped.
    ///
    /// Overlapping or duplicate matches (two addresses registered with the
    /// same MAC, or MACs sharing a byte run) cannot both be endpoint fields;
    /// only the earliest of each overlapping cluster is kept.
    fn strip_macs(&self, payload: &[u8]) -> (Vec<u8>, Vec<Mac>) {
        let mut hits: Vec<(usize, Mac)> = Vec::new();
        for (_, mac) in self.registry.iter() {
            if let Some(pos) = payload.windows(6).position(|w| w == &mac[..]) {
                hits.push((pos, *mac));
            }
        }
        hits.sort_by_key(|&(pos, _)| pos);

        let mut kept: Vec<(usize, Mac)> = Vec::new();
        for (pos, mac) in hits {
            if kept.len() == 2 {
                break;
            }
            if kept.last().map_or(true, |&(prev, _)| pos >= prev + 6) {
                kept.push((pos, mac));
            }
        }

        let mut out = payload.to_vec();
        for &(pos, _) in kept.iter().rev() {
            out.drain(pos..pos + 6);
        }
        (out, kept.into_iter().map(|(_, mac)| mac).collect())
    }

    fn classify_content(&mut self, address: u8, packet_type: PacketType, payload: &[u8]) -> String {
        match payload.first() {
            None => "empty payload".to_string(),
            Some(&code) => {
                let label = subtype_label(packet_type, code);
                if payload.len() > 1 {
                    let hexstr = self.apply_filter(address, &hex::encode(&payload[1..]));
                    if hexstr.is_empty() {
                        label
                    } else {
                        format!("{label} {hexstr}")
                    }
                } else {
                    label
                }
            }
        }
    }

    fn apply_filter(&mut self, address: u8, text: &str) -> String {
        let Some(pat) = self.config.filter.as_ref() else {
            return text.to_string();
        };
        if pat.is_empty() {
            return text.to_string();
        }
        let pat = pat.to_lowercase();
        let count = text.matches(pat.as_str()).count() as u32;
        if count == 0 {
            return text.to_string();
        }
        self.counters.filter_hits[(address & 0x1f) as usize] += count;
        text.replace(pat.as_str(), "")
    }

    /// A number-assign service command announces the address's master
    /// counter; capture it for later master-key decryption.
    fn maybe_seed_counter(&mut self, address: u8, packet_type: PacketType, payload: &[u8]) {
        if packet_type != PacketType::DtServ {
            return;
        }
        if payload.first() != Some(&SVC_NUMBER_ASSIGN) || payload.len() < 5 {
            return;
        }
        let mut counter = [0u8; 4];
        counter.copy_from_slice(&payload[1..5]);
        self.keys.seed_master_counter(address, counter);
    }
}

/// Handle to a running session worker.
pub struct SessionHandle {
    /// Rendered log lines, two-space separated fields.
    pub log_rx: Receiver<String>,
    /// Rendered UI lines, `@`-separated fields.
    pub ui_rx: Receiver<String>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<DecoderEngine>,
}

impl SessionHandle {
    /// Signal the worker to stop and wait for it to exit, returning the
    /// engine with whatever state it retained.
    ///
    /// # Panics
    /// If the worker thread panicked.
    #[must_use]
    pub fn stop(self) -> DecoderEngine {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().expect("decoder thread panicked")
    }
}

/// Start a dedicated worker for one bus session.
///
/// The worker's only blocking point is the timed wait on `chunks`; record
/// delivery is best-effort and a full sink drops the record with a one-line
/// diagnostic. The worker exits when the stop flag is raised or every chunk
/// producer has hung up.
///
/// # Panics
/// If the worker thread could not be started.
#[must_use]
pub fn spawn_session(mut engine: DecoderEngine, chunks: Receiver<Vec<u8>>) -> SessionHandle {
    let (log_tx, log_rx) = bounded(OUTBOUND_BUFFER);
    let (ui_tx, ui_rx) = bounded(OUTBOUND_BUFFER);
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let handle = thread::Builder::new()
        .name("orion2_decoder".into())
        .spawn(move || {
            loop {
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                let chunk = match chunks.recv_timeout(RECV_TIMEOUT) {
                    Ok(chunk) => chunk,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                if chunk.is_empty() {
                    continue;
                }
                for record in engine.handle_chunk(&chunk) {
                    deliver(&log_tx, record.log_line(), "log");
                    deliver(&ui_tx, record.ui_line(), "ui");
                }
            }
            engine.finish_session();
            engine
        })
        .expect("failed to spawn decoder thread");

    SessionHandle {
        log_rx,
        ui_rx,
        stop,
        handle,
    }
}

fn deliver(tx: &Sender<String>, line: String, sink: &str) {
    match tx.try_send(line) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!(sink, "outbound queue full; record dropped"),
        Err(TrySendError::Disconnected(_)) => debug!(sink, "outbound queue closed"),
    }
}

/// Feed a saved hex dump (one hex string per line) into a chunk channel,
/// producing the same chunk shape as the live readers. Undecodable lines are
/// skipped with a diagnostic. Returns the number of chunks sent.
///
/// # Errors
/// [Error::Io] reading the file.
pub fn load_hex_dump<P>(path: P, tx: &Sender<Vec<u8>>) -> Result<usize>
where
    P: AsRef<Path>,
{
    let file = fs::File::open(path)?;
    let mut sent = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match hex::decode(line) {
            Ok(chunk) => {
                if tx.send(chunk).is_ok() {
                    sent += 1;
                }
            }
            Err(err) => warn!(%err, line, "skipping undecodable dump line"),
        }
    }
    Ok(sent)
}
