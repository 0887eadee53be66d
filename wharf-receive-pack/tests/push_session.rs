//! End-to-end receive-pack sessions over in-memory repositories.

use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use wharf_hash::ObjectId;
use wharf_pktline::{encode, PacketLineRef, StreamingPeekableIter};
use wharf_receive_pack::hooks::PostReceiveHook;
use wharf_receive_pack::nonce::NonceGenerator;
use wharf_receive_pack::options::SignedPushOptions;
use wharf_receive_pack::pack::{IngestError, IngestedPack, PackIngestor, PackLock};
use wharf_receive_pack::{CommandResult, ReceiveOptions, ReceivePack};
use wharf_serve_core::memory::{InMemoryObjectDatabase, InMemoryRefDatabase};
use wharf_serve_core::progress::ProgressMonitor;
use wharf_serve_core::store::RefDatabase;
use wharf_serve_core::visibility::RefRecord;

const PACK_BYTES: &[u8] = b"PACKDATA";

fn oid(byte: u8) -> ObjectId {
    ObjectId::from_bytes_or_panic(&[byte; 20])
}

const ZERO: &str = "0000000000000000000000000000000000000000";

/// Consumes exactly the fake pack bytes and takes a `.keep` lock in a
/// temporary directory.
struct FakeIngestor {
    keep_path: Option<PathBuf>,
    new_objects: Vec<ObjectId>,
    fail_with: Option<String>,
    lock_message: String,
    abandoned: bool,
}

impl FakeIngestor {
    fn new(keep_path: Option<PathBuf>, new_objects: Vec<ObjectId>) -> Self {
        Self {
            keep_path,
            new_objects,
            fail_with: None,
            lock_message: String::new(),
            abandoned: false,
        }
    }
}

impl PackIngestor for FakeIngestor {
    fn set_lock_message(&mut self, message: &str) {
        self.lock_message = message.to_owned();
    }

    fn ingest(
        &mut self,
        input: &mut dyn Read,
        _progress: &mut dyn ProgressMonitor,
    ) -> Result<IngestedPack, IngestError> {
        let mut buf = vec![0u8; PACK_BYTES.len()];
        input.read_exact(&mut buf)?;
        if buf != PACK_BYTES {
            return Err(IngestError::Malformed("bad magic".into()));
        }
        if let Some(reason) = &self.fail_with {
            return Err(IngestError::Malformed(reason.clone()));
        }
        let lock = match &self.keep_path {
            Some(path) => {
                std::fs::write(path, format!("{}\n", self.lock_message)).map_err(IngestError::Io)?;
                Some(PackLock::new(path))
            }
            None => None,
        };
        Ok(IngestedPack {
            lock,
            new_objects: self.new_objects.clone(),
            external_bases: Vec::new(),
        })
    }

    fn abandon(&mut self) {
        self.abandoned = true;
    }
}

/// Wire helper: pkt text lines, a flush, then the raw pack bytes.
fn push_input(lines: &[String], pack: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    for line in lines {
        encode::text_to_write(line.as_bytes(), &mut buf).unwrap();
    }
    encode::flush_to_write(&mut buf).unwrap();
    if pack {
        buf.extend_from_slice(PACK_BYTES);
    }
    buf
}

/// Split the output into the advertisement and the report lines, unwrapping
/// a side-band report when present.
fn parse_output(output: &[u8], sideband: bool) -> (Vec<String>, Vec<String>) {
    let mut rd = StreamingPeekableIter::new(Cursor::new(output.to_vec()), &[PacketLineRef::Flush], false);
    let mut advertisement = Vec::new();
    while let Some(line) = rd.read_line() {
        let line = line.unwrap().unwrap();
        advertisement.push(String::from_utf8_lossy(line.as_text().unwrap()).into_owned());
    }
    rd.reset();

    let report_bytes = if sideband {
        let mut inner = Vec::new();
        rd.as_read_with_sidebands(|_| {}).read_to_end(&mut inner).unwrap();
        inner
    } else {
        let mut inner = Vec::new();
        rd.inner_mut().read_to_end(&mut inner).unwrap();
        inner
    };

    let mut report = Vec::new();
    let mut rd = StreamingPeekableIter::new(Cursor::new(report_bytes), &[PacketLineRef::Flush], false);
    while let Some(line) = rd.read_line() {
        let line = line.unwrap().unwrap();
        report.push(String::from_utf8_lossy(line.as_text().unwrap()).into_owned());
    }
    (advertisement, report)
}

#[test]
fn push_creating_one_ref() {
    // The odb already reflects the ingested pack: one new commit.
    let mut odb = InMemoryObjectDatabase::new();
    odb.insert_commit(oid(2), &[], None, 200);
    let mut refs = InMemoryRefDatabase::new();

    let dir = tempfile::tempdir().unwrap();
    let keep = dir.path().join("pack-push.keep");
    let mut ingestor = FakeIngestor::new(Some(keep.clone()), vec![oid(2)]);

    let post_count = Arc::new(AtomicUsize::new(0));
    let post_count2 = post_count.clone();
    let options = ReceiveOptions::default().with_post_receive(PostReceiveHook::new(move |commands, _| {
        assert_eq!(commands.len(), 1);
        assert!(commands[0].is_ok());
        post_count2.fetch_add(1, Ordering::SeqCst);
    }));

    let input = push_input(
        &[format!(
            "{ZERO} {} refs/heads/feature\0report-status side-band-64k",
            oid(2)
        )],
        true,
    );
    let mut output = Vec::new();
    let outcome = ReceivePack::new(&odb, &mut refs, options)
        .run(Cursor::new(input), &mut output, &mut ingestor)
        .unwrap();

    // The ref database holds the new ref.
    assert_eq!(
        refs.find("refs/heads/feature").unwrap().unwrap().object_id(),
        Some(oid(2))
    );

    let (advertisement, report) = parse_output(&output, true);
    assert!(advertisement[0].starts_with(&format!("{ZERO} capabilities^{{}}\0")));
    assert_eq!(report, vec!["unpack ok", "ok refs/heads/feature"]);
    assert_eq!(report.iter().filter(|l| l.starts_with("unpack")).count(), 1);

    // The pack lock was released exactly once, and the pack kept.
    assert!(!keep.exists());
    assert!(!ingestor.abandoned);
    assert_eq!(ingestor.lock_message, "receive-pack");
    assert_eq!(post_count.load(Ordering::SeqCst), 1);
    assert!(outcome.commands.iter().all(|c| !c.is_pending()));
}

#[test]
fn non_fast_forward_push_is_rejected() {
    let mut odb = InMemoryObjectDatabase::new();
    odb.insert_commit(oid(1), &[], None, 100); // A
    odb.insert_commit(oid(2), &[oid(1)], None, 200); // current main
    odb.insert_commit(oid(3), &[oid(1)], None, 300); // B, diverged
    let mut refs = InMemoryRefDatabase::new();
    refs.insert(RefRecord::new(oid(2), "refs/heads/main"));

    let dir = tempfile::tempdir().unwrap();
    let keep = dir.path().join("pack-nff.keep");
    let mut ingestor = FakeIngestor::new(Some(keep.clone()), vec![oid(3)]);

    let mut options = ReceiveOptions::default();
    options.deny_non_fast_forwards = true;

    let input = push_input(
        &[format!("{} {} refs/heads/main\0report-status", oid(2), oid(3))],
        true,
    );
    let mut output = Vec::new();
    ReceivePack::new(&odb, &mut refs, options)
        .run(Cursor::new(input), &mut output, &mut ingestor)
        .unwrap();

    // The ref is unchanged and the pack discarded.
    assert_eq!(
        refs.find("refs/heads/main").unwrap().unwrap().object_id(),
        Some(oid(2))
    );
    let (_, report) = parse_output(&output, false);
    assert_eq!(report, vec!["unpack ok", "ng refs/heads/main non-fast-forward"]);
    assert!(!keep.exists());
    assert!(ingestor.abandoned);
}

#[test]
fn atomic_batch_aborts_as_a_whole() {
    let mut odb = InMemoryObjectDatabase::new();
    odb.insert_commit(oid(1), &[], None, 100);
    odb.insert_commit(oid(2), &[oid(1)], None, 200); // current main
    odb.insert_commit(oid(3), &[oid(1)], None, 300); // diverged
    odb.insert_commit(oid(4), &[], None, 400);
    odb.insert_commit(oid(5), &[], None, 500);
    let mut refs = InMemoryRefDatabase::new();
    refs.insert(RefRecord::new(oid(2), "refs/heads/main"));

    let mut ingestor = FakeIngestor::new(None, vec![oid(3), oid(4), oid(5)]);
    let mut options = ReceiveOptions::default();
    options.deny_non_fast_forwards = true;

    let input = push_input(
        &[
            format!("{ZERO} {} refs/heads/one\0report-status atomic", oid(4)),
            format!("{} {} refs/heads/main", oid(2), oid(3)),
            format!("{ZERO} {} refs/heads/two", oid(5)),
        ],
        true,
    );
    let mut output = Vec::new();
    let outcome = ReceivePack::new(&odb, &mut refs, options)
        .run(Cursor::new(input), &mut output, &mut ingestor)
        .unwrap();

    let (_, report) = parse_output(&output, false);
    assert_eq!(
        report,
        vec![
            "unpack ok",
            "ng refs/heads/one transaction aborted",
            "ng refs/heads/main non-fast-forward",
            "ng refs/heads/two transaction aborted",
        ]
    );

    // Nothing was executed.
    assert!(refs.find("refs/heads/one").unwrap().is_none());
    assert!(refs.find("refs/heads/two").unwrap().is_none());
    assert_eq!(
        refs.find("refs/heads/main").unwrap().unwrap().object_id(),
        Some(oid(2))
    );
    assert!(outcome.commands.iter().all(|c| !c.is_ok()));
}

#[test]
fn unpack_failure_rejects_every_command() {
    let mut odb = InMemoryObjectDatabase::new();
    odb.insert_commit(oid(2), &[], None, 200);
    let mut refs = InMemoryRefDatabase::new();

    let mut ingestor = FakeIngestor::new(None, vec![]);
    ingestor.fail_with = Some("index-pack abnormal exit".into());

    let input = push_input(
        &[format!("{ZERO} {} refs/heads/feature\0report-status", oid(2))],
        true,
    );
    let mut output = Vec::new();
    let outcome = ReceivePack::new(&odb, &mut refs, ReceiveOptions::default())
        .run(Cursor::new(input), &mut output, &mut ingestor)
        .unwrap();

    assert_eq!(outcome.unpack_error.as_deref(), Some("index-pack abnormal exit"));
    let (_, report) = parse_output(&output, false);
    assert_eq!(
        report,
        vec![
            "unpack index-pack abnormal exit",
            "ng refs/heads/feature unpacker error",
        ]
    );
    assert!(refs.find("refs/heads/feature").unwrap().is_none());
    assert!(ingestor.abandoned);
}

#[test]
fn signed_push_with_certificate_is_accepted() {
    let mut odb = InMemoryObjectDatabase::new();
    odb.insert_commit(oid(2), &[], None, 200);
    let mut refs = InMemoryRefDatabase::new();

    let generator = NonceGenerator::new("process-wide-seed".as_bytes());
    let nonce = generator.generate();
    let options = ReceiveOptions::default().with_signed_push(SignedPushOptions::new(generator));

    let mut lines = vec![format!("push-cert\0report-status")];
    for cert_line in [
        "certificate version 0.1".to_owned(),
        "pusher A U Thor <author@example.com> 1700000000 +0000".to_owned(),
        "pushee ssh://example.com/repo.git".to_owned(),
        format!("nonce {nonce}"),
        String::new(),
        format!("{ZERO} {} refs/heads/feature", oid(2)),
        String::new(),
        "-----BEGIN PGP SIGNATURE-----".to_owned(),
        "SIGDATA".to_owned(),
        "-----END PGP SIGNATURE-----".to_owned(),
        "push-cert-end".to_owned(),
    ] {
        lines.push(cert_line);
    }

    let mut ingestor = FakeIngestor::new(None, vec![oid(2)]);
    let input = push_input(&lines, true);
    let mut output = Vec::new();
    let outcome = ReceivePack::new(&odb, &mut refs, options)
        .run(Cursor::new(input), &mut output, &mut ingestor)
        .unwrap();

    // The advertisement carried the nonce.
    let (advertisement, report) = parse_output(&output, false);
    assert!(advertisement[0].contains("push-cert="));

    // The certificate was accepted and the command flowed into the
    // normal validate path.
    let cert = outcome.certificate.expect("certificate present");
    assert!(cert.nonce_status.is_accepted());
    assert_eq!(cert.commands.len(), 1);
    assert_eq!(report, vec!["unpack ok", "ok refs/heads/feature"]);
    assert_eq!(
        refs.find("refs/heads/feature").unwrap().unwrap().object_id(),
        Some(oid(2))
    );
}

#[test]
fn signed_push_with_forged_nonce_is_rejected() {
    let mut odb = InMemoryObjectDatabase::new();
    odb.insert_commit(oid(2), &[], None, 200);
    let mut refs = InMemoryRefDatabase::new();

    let generator = NonceGenerator::new("process-wide-seed".as_bytes());
    let options = ReceiveOptions::default().with_signed_push(SignedPushOptions::new(generator));

    let mut lines = vec![format!("push-cert\0report-status")];
    for cert_line in [
        "certificate version 0.1".to_owned(),
        "pusher someone".to_owned(),
        format!("nonce 1700000000-{}", "ab".repeat(20)),
        String::new(),
        format!("{ZERO} {} refs/heads/feature", oid(2)),
        String::new(),
        "-----BEGIN PGP SIGNATURE-----".to_owned(),
        "SIGDATA".to_owned(),
        "-----END PGP SIGNATURE-----".to_owned(),
        "push-cert-end".to_owned(),
    ] {
        lines.push(cert_line);
    }

    let mut ingestor = FakeIngestor::new(None, vec![oid(2)]);
    let input = push_input(&lines, true);
    let mut output = Vec::new();
    let outcome = ReceivePack::new(&odb, &mut refs, options)
        .run(Cursor::new(input), &mut output, &mut ingestor)
        .unwrap();

    assert!(!outcome.certificate.unwrap().nonce_status.is_accepted());
    assert!(refs.find("refs/heads/feature").unwrap().is_none());
    let (_, report) = parse_output(&output, false);
    assert_eq!(report, vec!["unpack ok", "ng refs/heads/feature invalid nonce"]);
}

#[test]
fn delete_only_push_reads_no_pack() {
    let mut odb = InMemoryObjectDatabase::new();
    odb.insert_commit(oid(2), &[], None, 200);
    let mut refs = InMemoryRefDatabase::new();
    refs.insert(RefRecord::new(oid(2), "refs/heads/gone"));

    let mut ingestor = FakeIngestor::new(None, vec![]);
    // No pack bytes follow the flush.
    let input = push_input(
        &[format!("{} {ZERO} refs/heads/gone\0report-status delete-refs", oid(2))],
        false,
    );
    let mut output = Vec::new();
    ReceivePack::new(&odb, &mut refs, ReceiveOptions::default())
        .run(Cursor::new(input), &mut output, &mut ingestor)
        .unwrap();

    assert!(refs.find("refs/heads/gone").unwrap().is_none());
    let (_, report) = parse_output(&output, false);
    assert_eq!(report, vec!["unpack ok", "ok refs/heads/gone"]);
}

#[test]
fn missing_objects_reject_the_command() {
    // The pushed tip references a parent that neither side owns.
    let mut odb = InMemoryObjectDatabase::new();
    odb.insert_commit(oid(3), &[oid(9)], None, 300);
    let mut refs = InMemoryRefDatabase::new();

    let mut ingestor = FakeIngestor::new(None, vec![oid(3)]);
    let input = push_input(
        &[format!("{ZERO} {} refs/heads/broken\0report-status", oid(3))],
        true,
    );
    let mut output = Vec::new();
    ReceivePack::new(&odb, &mut refs, ReceiveOptions::default())
        .run(Cursor::new(input), &mut output, &mut ingestor)
        .unwrap();

    assert!(refs.find("refs/heads/broken").unwrap().is_none());
    let (_, report) = parse_output(&output, false);
    assert_eq!(
        report,
        vec!["unpack ok", "ng refs/heads/broken missing necessary objects"]
    );
}

#[test]
fn current_branch_update_is_refused() {
    let mut odb = InMemoryObjectDatabase::new();
    odb.insert_commit(oid(1), &[], None, 100);
    odb.insert_commit(oid(2), &[oid(1)], None, 200);
    let mut refs = InMemoryRefDatabase::new();
    refs.insert(RefRecord::new(oid(1), "refs/heads/main"));
    refs.set_checked_out(Some("refs/heads/main".to_owned()));

    let mut ingestor = FakeIngestor::new(None, vec![oid(2)]);
    let input = push_input(
        &[format!("{} {} refs/heads/main\0report-status", oid(1), oid(2))],
        true,
    );
    let mut output = Vec::new();
    ReceivePack::new(&odb, &mut refs, ReceiveOptions::default())
        .run(Cursor::new(input), &mut output, &mut ingestor)
        .unwrap();

    let (_, report) = parse_output(&output, false);
    assert_eq!(
        report,
        vec!["unpack ok", "ng refs/heads/main branch is currently checked out"]
    );
}

#[test]
fn push_options_are_collected_after_the_pack() {
    let mut odb = InMemoryObjectDatabase::new();
    odb.insert_commit(oid(2), &[], None, 200);
    let mut refs = InMemoryRefDatabase::new();

    let mut input = Vec::new();
    encode::text_to_write(
        format!("{ZERO} {} refs/heads/feature\0report-status push-options", oid(2)).as_bytes(),
        &mut input,
    )
    .unwrap();
    encode::flush_to_write(&mut input).unwrap();
    input.extend_from_slice(PACK_BYTES);
    encode::text_to_write(b"notify=reviewers", &mut input).unwrap();
    encode::text_to_write(b"ci=skip", &mut input).unwrap();
    encode::flush_to_write(&mut input).unwrap();

    let mut ingestor = FakeIngestor::new(None, vec![oid(2)]);
    let mut output = Vec::new();
    let outcome = ReceivePack::new(&odb, &mut refs, ReceiveOptions::default())
        .run(Cursor::new(input), &mut output, &mut ingestor)
        .unwrap();

    assert_eq!(outcome.push_options, vec!["notify=reviewers", "ci=skip"]);
}
