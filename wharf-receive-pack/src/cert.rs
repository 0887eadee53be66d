//! The signed-push certificate and its line-oriented parser.

use crate::error::{Error, Result};
use crate::nonce::{NonceGenerator, NonceStatus};

/// The marker opening a PGP signature block.
pub const BEGIN_SIGNATURE: &str = "-----BEGIN PGP SIGNATURE-----";
/// The marker closing a PGP signature block.
pub const END_SIGNATURE: &str = "-----END PGP SIGNATURE-----";
/// The only certificate version this parser understands.
pub const VERSION_0_1: &str = "0.1";

/// A structurally valid push certificate.
///
/// Cryptographic verification of [`signature`](Self::signature) over
/// [`text_payload`](Self::text_payload) is delegated to an injected
/// verifier; this type only guarantees structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushCertificate {
    /// The certificate version, always `0.1`.
    pub version: String,
    /// The pusher's ident line, freeform.
    pub pusher: String,
    /// The destination URL the client believes it pushed to.
    pub pushee: Option<String>,
    /// The nonce echoed by the client.
    pub nonce: String,
    /// The verification status of the nonce.
    pub nonce_status: NonceStatus,
    /// The command lines, verbatim, in wire order.
    pub commands: Vec<String>,
    /// The raw armored signature block including its markers.
    pub signature: String,
    /// The signed input: header block, blank line, command block.
    pub text_payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Version,
    Pusher,
    NonceOrPushee,
    BlankBeforeCommands,
    Commands,
    SignatureBegin,
    SignatureBody,
    Done,
}

/// Configuration for nonce verification during certificate parsing.
pub struct NonceVerification<'a> {
    /// The generator holding the process-wide seed.
    pub generator: &'a NonceGenerator,
    /// The nonce embedded in our `push-cert=` advertisement, if any.
    pub sent: String,
    /// Accept sibling frontends' nonces within the slop window.
    pub allow_slop: bool,
    /// The slop window in seconds.
    pub slop_seconds: i64,
}

/// A straight line-oriented state machine over the certificate block.
pub struct PushCertificateParser<'a> {
    expect: Expect,
    verification: Option<NonceVerification<'a>>,
    version: String,
    pusher: String,
    pushee: Option<String>,
    nonce: String,
    nonce_status: NonceStatus,
    commands: Vec<String>,
    signature: String,
    payload: String,
}

impl<'a> PushCertificateParser<'a> {
    /// Create a parser; `verification` enables nonce checking via the
    /// nonce service.
    pub fn new(verification: Option<NonceVerification<'a>>) -> Self {
        Self {
            expect: Expect::Version,
            verification,
            version: String::new(),
            pusher: String::new(),
            pushee: None,
            nonce: String::new(),
            nonce_status: NonceStatus::Missing,
            commands: Vec::new(),
            signature: String::new(),
            payload: String::new(),
        }
    }

    /// Whether the closing signature marker was consumed.
    pub fn is_done(&self) -> bool {
        self.expect == Expect::Done
    }

    /// Feed one certificate line, without its trailing newline.
    pub fn feed(&mut self, line: &str) -> Result<()> {
        match self.expect {
            Expect::Version => {
                let rest = line.strip_prefix("certificate ").unwrap_or(line);
                let Some(version) = rest.strip_prefix("version ") else {
                    return Err(Error::Certificate(format!("expected version line, got '{line}'")));
                };
                if version != VERSION_0_1 {
                    return Err(Error::Certificate(format!("unsupported version '{version}'")));
                }
                self.version = version.to_owned();
                self.push_payload(line);
                self.expect = Expect::Pusher;
            }
            Expect::Pusher => {
                let Some(pusher) = line.strip_prefix("pusher ") else {
                    return Err(Error::Certificate(format!("expected pusher line, got '{line}'")));
                };
                self.pusher = pusher.to_owned();
                self.push_payload(line);
                self.expect = Expect::NonceOrPushee;
            }
            Expect::NonceOrPushee => {
                if let Some(pushee) = line.strip_prefix("pushee ") {
                    if self.pushee.replace(pushee.to_owned()).is_some() {
                        return Err(Error::Certificate("duplicate pushee line".into()));
                    }
                    self.push_payload(line);
                } else if let Some(nonce) = line.strip_prefix("nonce ") {
                    if nonce.is_empty() {
                        return Err(Error::Certificate("empty nonce".into()));
                    }
                    self.nonce = nonce.to_owned();
                    self.nonce_status = match &self.verification {
                        Some(v) => v.generator.verify(&self.nonce, &v.sent, v.allow_slop, v.slop_seconds),
                        None => NonceStatus::Unsolicited,
                    };
                    self.push_payload(line);
                    self.expect = Expect::BlankBeforeCommands;
                } else {
                    return Err(Error::Certificate(format!(
                        "expected pushee or nonce line, got '{line}'"
                    )));
                }
            }
            Expect::BlankBeforeCommands => {
                if !line.is_empty() {
                    return Err(Error::Certificate(format!(
                        "expected blank line before commands, got '{line}'"
                    )));
                }
                self.push_payload(line);
                self.expect = Expect::Commands;
            }
            Expect::Commands => {
                if line.is_empty() {
                    if self.commands.is_empty() {
                        return Err(Error::Certificate("certificate carries no commands".into()));
                    }
                    self.expect = Expect::SignatureBegin;
                } else {
                    // Structure only: three space-separated fields.
                    if line.split(' ').count() != 3 {
                        return Err(Error::Certificate(format!("malformed command line '{line}'")));
                    }
                    self.commands.push(line.to_owned());
                    self.push_payload(line);
                }
            }
            Expect::SignatureBegin => {
                if line != BEGIN_SIGNATURE {
                    return Err(Error::Certificate(format!(
                        "signature must begin with '{BEGIN_SIGNATURE}'"
                    )));
                }
                self.signature.push_str(line);
                self.signature.push('\n');
                self.expect = Expect::SignatureBody;
            }
            Expect::SignatureBody => {
                self.signature.push_str(line);
                self.signature.push('\n');
                if line == END_SIGNATURE {
                    self.expect = Expect::Done;
                }
            }
            Expect::Done => {
                return Err(Error::Certificate(format!("trailing line after signature: '{line}'")));
            }
        }
        Ok(())
    }

    /// Finish parsing and produce the certificate value.
    pub fn finish(self) -> Result<PushCertificate> {
        if self.expect != Expect::Done {
            return Err(Error::Certificate("truncated certificate".into()));
        }
        Ok(PushCertificate {
            version: self.version,
            pusher: self.pusher,
            pushee: self.pushee,
            nonce: self.nonce,
            nonce_status: self.nonce_status,
            commands: self.commands,
            signature: self.signature,
            text_payload: self.payload,
        })
    }

    fn push_payload(&mut self, line: &str) {
        self.payload.push_str(line);
        self.payload.push('\n');
    }
}
