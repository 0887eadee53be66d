//! The ACK/NAK negotiation loop of the have phase.

use std::collections::{HashSet, VecDeque};
use std::io;

use wharf_hash::ObjectId;
use wharf_pktline::{encode, PacketLineRef, StreamingPeekableIter};
use wharf_serve_core::capabilities::MultiAckMode;
use wharf_serve_core::progress::ProgressMonitor;
use wharf_serve_core::store::{ObjectDatabase, ObjectKind};

use crate::error::{Error, Result};
use crate::options::HAVES_PER_ROUND;
use crate::request::parse_oid;

/// The result of a completed negotiation.
#[derive(Debug, Clone, Default)]
pub struct NegotiationResult {
    /// Objects both sides own, in the order they were discovered.
    pub common: Vec<ObjectId>,
    /// Whether the client sent `done` (as opposed to the server stopping
    /// early after `ready` under `no-done`).
    pub client_done: bool,
    /// Number of flush-delimited rounds processed.
    pub rounds: u32,
    /// Number of `have` lines processed.
    pub haves: u64,
}

/// Drives the server side of the have phase.
pub struct Negotiator<'a, O: ObjectDatabase> {
    odb: &'a O,
    wants: &'a [ObjectId],
    multi_ack: MultiAckMode,
    no_done: bool,
    common: Vec<ObjectId>,
    common_set: HashSet<ObjectId>,
    covered_wants: HashSet<ObjectId>,
}

impl<'a, O: ObjectDatabase> Negotiator<'a, O> {
    /// Create a negotiator for the validated `wants`.
    pub fn new(odb: &'a O, wants: &'a [ObjectId], multi_ack: MultiAckMode, no_done: bool) -> Self {
        Self {
            odb,
            wants,
            multi_ack,
            no_done,
            common: Vec::new(),
            common_set: HashSet::new(),
            covered_wants: HashSet::new(),
        }
    }

    /// Process have rounds until the client sends `done`, the server is
    /// ready to stop early, or the transport fails.
    pub fn run<R: io::Read, W: io::Write>(
        mut self,
        input: &mut StreamingPeekableIter<R>,
        out: &mut W,
        monitor: &mut dyn ProgressMonitor,
    ) -> Result<NegotiationResult> {
        let mut result = NegotiationResult::default();
        let mut sent_ready = false;
        let mut acked_plain = false;
        let mut haves_in_batch = 0usize;

        'rounds: loop {
            if monitor.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let mut acked_this_round = false;

            loop {
                let Some(line) = input.read_line() else { break };
                let line = line??;
                let text = line
                    .as_text()
                    .ok_or_else(|| Error::protocol("unexpected control packet in have phase"))?;
                let text = std::str::from_utf8(text)
                    .map_err(|_| Error::protocol("have line is not valid UTF-8"))?;

                if text == "done" {
                    result.client_done = true;
                    break 'rounds;
                }
                let Some(hex) = text.strip_prefix("have ") else {
                    return Err(Error::protocol(format!("unexpected line '{text}' in have phase")));
                };
                let oid = parse_oid(hex)?;
                result.haves += 1;
                haves_in_batch += 1;
                if haves_in_batch >= HAVES_PER_ROUND {
                    haves_in_batch = 0;
                    if monitor.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                }

                if !self.odb.contains(&oid) || self.common_set.contains(&oid) {
                    continue;
                }
                self.common_set.insert(oid);
                self.common.push(oid);

                match self.multi_ack {
                    MultiAckMode::None => {
                        if !acked_plain {
                            write_line(out, &format!("ACK {oid}"))?;
                            acked_plain = true;
                            acked_this_round = true;
                        }
                    }
                    MultiAckMode::Basic => {
                        write_line(out, &format!("ACK {oid} continue"))?;
                        acked_this_round = true;
                    }
                    MultiAckMode::Detailed => {
                        if !sent_ready && self.wants_covered()? {
                            write_line(out, &format!("ACK {oid} ready"))?;
                            sent_ready = true;
                        } else {
                            write_line(out, &format!("ACK {oid} common"))?;
                        }
                        acked_this_round = true;
                    }
                }
            }

            if input.stopped_at() != Some(PacketLineRef::Flush) {
                return Err(Error::protocol("client hung up during negotiation"));
            }

            // Round ended on a flush.
            result.rounds += 1;
            input.reset();
            if sent_ready && self.no_done {
                // The client promised not to wait for `done`.
                break;
            }
            if !acked_this_round || self.multi_ack != MultiAckMode::None {
                write_line(out, "NAK")?;
            }
            out.flush()?;
        }

        if result.client_done {
            match self.common.last() {
                Some(last) => write_line(out, &format!("ACK {last}"))?,
                None => write_line(out, "NAK")?,
            }
            out.flush()?;
        }

        tracing::debug!(
            common = self.common.len(),
            rounds = result.rounds,
            haves = result.haves,
            "negotiation finished"
        );
        result.common = self.common;
        Ok(result)
    }

    /// The ready condition: the frontier of uninteresting objects covers
    /// every want, i.e. each want reaches a common commit (or is itself
    /// common) without leaving known history.
    fn wants_covered(&mut self) -> Result<bool> {
        'wants: for want in self.wants {
            if self.covered_wants.contains(want) {
                continue;
            }
            let mut visited = HashSet::new();
            let mut queue = VecDeque::from([*want]);
            while let Some(id) = queue.pop_front() {
                if !visited.insert(id) {
                    continue;
                }
                if self.common_set.contains(&id) {
                    self.covered_wants.insert(*want);
                    continue 'wants;
                }
                let Some(info) = self.odb.info(&id)? else { continue };
                match info.kind {
                    ObjectKind::Commit => queue.extend(info.parents()),
                    ObjectKind::Tag => queue.extend(info.links.iter().map(|l| l.id)),
                    _ => {}
                }
            }
            return Ok(false);
        }
        Ok(true)
    }
}

fn write_line<W: io::Write>(out: &mut W, line: &str) -> Result<()> {
    encode::text_to_write(line.as_bytes(), out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use wharf_serve_core::memory::InMemoryObjectDatabase;
    use wharf_serve_core::progress::NoopMonitor;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes_or_panic(&[byte; 20])
    }

    /// c1 <- c2 <- c3 (tip); the client is assumed to want c3.
    fn odb() -> InMemoryObjectDatabase {
        let mut odb = InMemoryObjectDatabase::new();
        odb.insert_commit(oid(1), &[], None, 100);
        odb.insert_commit(oid(2), &[oid(1)], None, 200);
        odb.insert_commit(oid(3), &[oid(2)], None, 300);
        odb
    }

    fn wire(lines: &[&str], trailing_flushes: &[bool]) -> Vec<u8> {
        // Each entry of trailing_flushes inserts a flush after the line at
        // the same index; a final `done` is sent by passing it in lines.
        let mut buf = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            encode::text_to_write(line.as_bytes(), &mut buf).unwrap();
            if trailing_flushes.get(i).copied().unwrap_or(false) {
                encode::flush_to_write(&mut buf).unwrap();
            }
        }
        buf
    }

    fn run(
        lines: &[&str],
        flushes: &[bool],
        multi_ack: MultiAckMode,
        no_done: bool,
    ) -> (NegotiationResult, Vec<String>) {
        let odb = odb();
        let wants = [oid(3)];
        let mut input = StreamingPeekableIter::new(
            Cursor::new(wire(lines, flushes)),
            &[PacketLineRef::Flush],
            false,
        );
        let mut out = Vec::new();
        let result = Negotiator::new(&odb, &wants, multi_ack, no_done)
            .run(&mut input, &mut out, &mut NoopMonitor)
            .unwrap();

        let mut rd = StreamingPeekableIter::new(Cursor::new(out), &[], false);
        let mut acks = Vec::new();
        while let Some(line) = rd.read_line() {
            let line = line.unwrap().unwrap();
            if let Some(text) = line.as_text() {
                acks.push(String::from_utf8_lossy(text).into_owned());
            }
        }
        (result, acks)
    }

    #[test]
    fn immediate_done_gets_nak() {
        let (result, acks) = run(&["done"], &[], MultiAckMode::None, false);
        assert!(result.client_done);
        assert!(result.common.is_empty());
        assert_eq!(acks, vec!["NAK"]);
    }

    #[test]
    fn plain_mode_acks_once() {
        let have1 = format!("have {}", oid(1));
        let have2 = format!("have {}", oid(2));
        let (result, acks) = run(&[&have1, &have2, "done"], &[], MultiAckMode::None, false);
        assert_eq!(result.common.len(), 2);
        assert_eq!(acks, vec![format!("ACK {}", oid(1)), format!("ACK {}", oid(2))]);
    }

    #[test]
    fn detailed_mode_reports_common_then_ready() {
        let have1 = format!("have {}", oid(1));
        let have2 = format!("have {}", oid(2));
        let (_, acks) = run(&[&have1, &have2, "done"], &[], MultiAckMode::Detailed, false);
        // c3 reaches c1 through c2, so the first common commit already
        // covers the want and is announced as ready.
        assert_eq!(
            acks,
            vec![
                format!("ACK {} ready", oid(1)),
                format!("ACK {} common", oid(2)),
                format!("ACK {}", oid(2)),
            ]
        );
    }

    #[test]
    fn unknown_haves_get_nak_per_round() {
        let have9 = format!("have {}", oid(9));
        let (result, acks) = run(&[&have9, "done"], &[true], MultiAckMode::Detailed, false);
        assert!(result.common.is_empty());
        assert_eq!(result.rounds, 1);
        assert_eq!(acks, vec!["NAK", "NAK"]);
    }

    #[test]
    fn no_done_stops_after_ready_round() {
        let have2 = format!("have {}", oid(2));
        let (result, acks) = run(&[&have2], &[true], MultiAckMode::Detailed, true);
        assert!(!result.client_done);
        assert_eq!(acks, vec![format!("ACK {} ready", oid(2))]);
    }
}
