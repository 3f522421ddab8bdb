//! The operation context: a resumable state machine driving one encryption
//! or decryption operation to completion.
//!
//! A context never blocks and never performs I/O. Each public call is one
//! suspension boundary: in the `NeedCollInfo`, `NeedMarkings`, and `NeedKeys`
//! states the caller relays one database round trip ([`Ctx::db_request`] /
//! [`Ctx::db_feed`] / [`Ctx::db_done`]); in `NeedKms` the caller drains KMS
//! exchanges ([`Ctx::next_kms_request`] / [`Ctx::kms_done`]); in `Ready` the
//! caller collects the result ([`Ctx::finalize`]).
//!
//! Calls made in the wrong state fail the context with a `wrong state` client
//! error; the context then stays in [`State::Error`] and keeps reporting its
//! first error. A context is owned by one thread at a time and is cancelled
//! by dropping it.

mod decrypt;
mod encrypt;

use std::sync::Arc;

use common::{Error, Result, Status};
use serde_json::Value;
use tracing::debug;

use crate::broker::KeyBroker;
use crate::crypt::Crypt;
use crate::kms::KmsContext;

use decrypt::DecryptCtx;
use encrypt::EncryptCtx;

/// Where an operation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the collection-info document.
    NeedCollInfo,
    /// Waiting for the marked command from the marking engine.
    NeedMarkings,
    /// Waiting for key-vault documents.
    NeedKeys,
    /// Waiting for KMS exchanges to be driven.
    NeedKms,
    /// All inputs gathered; [`Ctx::finalize`] may run.
    Ready,
    /// Finalized. Terminal.
    Done,
    /// The operation has nothing to encrypt. Terminal.
    NothingToDo,
    /// The context failed. Terminal.
    Error,
}

/// Per-operation specialization: what varies between encrypt and decrypt.
///
/// Key fetching and KMS handling are fixed and owned by the broker; only the
/// schema/marking phases and finalization differ.
#[derive(Debug)]
enum Strategy {
    Encrypt(EncryptCtx),
    Decrypt(DecryptCtx),
}

/// One encryption or decryption operation.
#[derive(Debug)]
pub struct Ctx {
    crypt: Arc<Crypt>,
    broker: KeyBroker,
    status: Status,
    state: State,
    strategy: Strategy,
}

impl Ctx {
    pub(crate) fn new_encrypt(crypt: Arc<Crypt>, namespace: &str, command: Value) -> Result<Self> {
        let mut strategy = EncryptCtx::new(namespace, command)?;

        let state = match crypt.schema_cache().get(namespace) {
            Some(schema) if schema.is_null() => State::NothingToDo,
            Some(schema) => {
                strategy.set_cached_schema((*schema).clone());
                State::NeedMarkings
            }
            None => State::NeedCollInfo,
        };
        debug!(namespace, ?state, "encrypt context created");

        Ok(Self {
            crypt,
            // TODO: let a strategy opt out of require_all once a caller needs
            // partial key resolution.
            broker: KeyBroker::new(true),
            status: Status::new(),
            state,
            strategy: Strategy::Encrypt(strategy),
        })
    }

    pub(crate) fn new_decrypt(crypt: Arc<Crypt>, payload: Value) -> Result<Self> {
        let mut broker = KeyBroker::new(true);
        let strategy = DecryptCtx::new(payload, &mut broker)?;
        debug!("decrypt context created");

        Ok(Self {
            crypt,
            broker,
            status: Status::new(),
            state: State::NeedKeys,
            strategy: Strategy::Decrypt(strategy),
        })
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Current status; non-ok once the context has failed.
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// The next outbound database document for the current phase: the
    /// collection-info filter, the command for the marking engine, or the
    /// key-vault filter.
    pub fn db_request(&mut self) -> Result<Value> {
        let result = match self.state {
            State::NeedCollInfo => match &self.strategy {
                Strategy::Encrypt(e) => e.op_collinfo(),
                Strategy::Decrypt(_) => Err(wrong_state()),
            },
            State::NeedMarkings => match &self.strategy {
                Strategy::Encrypt(e) => e.op_markings(),
                Strategy::Decrypt(_) => Err(wrong_state()),
            },
            State::NeedKeys => self.broker.filter(),
            _ => Err(wrong_state()),
        };
        result.map_err(|e| self.fail(e))
    }

    /// Ingest one reply document for the current phase. May be called once
    /// per reply; the key-fetch phase accepts any number of documents.
    pub fn db_feed(&mut self, doc: &Value) -> Result<()> {
        let result = match self.state {
            State::NeedCollInfo => match &mut self.strategy {
                Strategy::Encrypt(e) => e.feed_collinfo(doc),
                Strategy::Decrypt(_) => Err(wrong_state()),
            },
            State::NeedMarkings => match &mut self.strategy {
                Strategy::Encrypt(e) => e.feed_markings(doc, &mut self.broker),
                Strategy::Decrypt(_) => Err(wrong_state()),
            },
            State::NeedKeys => self.broker.add_doc(doc),
            _ => Err(wrong_state()),
        };
        result.map_err(|e| self.fail(e))
    }

    /// Close the current ingestion phase and advance.
    pub fn db_done(&mut self) -> Result<()> {
        match self.state {
            State::NeedCollInfo => {
                let next = match &mut self.strategy {
                    Strategy::Encrypt(e) => e.done_collinfo(&self.crypt),
                    Strategy::Decrypt(_) => return Err(self.fail(wrong_state())),
                };
                self.transition(next);
                Ok(())
            }
            State::NeedMarkings => {
                let next = match &self.strategy {
                    Strategy::Encrypt(e) => e.done_markings(&self.broker),
                    Strategy::Decrypt(_) => return Err(self.fail(wrong_state())),
                };
                self.transition(next);
                Ok(())
            }
            State::NeedKeys => {
                if let Err(e) = self.broker.done_adding_docs(&self.crypt) {
                    return Err(self.fail(e));
                }
                if self.broker.needs_kms() {
                    self.transition(State::NeedKms);
                } else {
                    // Nothing to exchange (no keys, or all unwrapped locally):
                    // verify and go straight to Ready.
                    if let Err(e) = self.broker.kms_done() {
                        return Err(self.fail(e));
                    }
                    self.transition(State::Ready);
                }
                Ok(())
            }
            _ => Err(self.fail(wrong_state())),
        }
    }

    /// The next KMS exchange with outstanding work, or `None` when all are
    /// finished. Exchanges are visited in key insertion order and may be
    /// drained cooperatively.
    pub fn next_kms_request(&mut self) -> Result<Option<&mut KmsContext>> {
        match self.state {
            State::NeedKms => Ok(self.broker.next_kms()),
            _ => Err(self.fail(wrong_state())),
        }
    }

    /// Assert that every KMS exchange finished; advances to [`State::Ready`].
    pub fn kms_done(&mut self) -> Result<()> {
        match self.state {
            State::NeedKms => match self.broker.kms_done() {
                Ok(()) => {
                    self.transition(State::Ready);
                    Ok(())
                }
                Err(e) => Err(self.fail(e)),
            },
            _ => Err(self.fail(wrong_state())),
        }
    }

    /// Produce the operation's final document and finish the context.
    pub fn finalize(&mut self) -> Result<Value> {
        match self.state {
            State::Ready => {
                let result = match &self.strategy {
                    Strategy::Encrypt(e) => e.finalize(&self.crypt, &self.broker),
                    Strategy::Decrypt(d) => d.finalize(&self.crypt, &self.broker),
                };
                match result {
                    Ok(doc) => {
                        self.transition(State::Done);
                        Ok(doc)
                    }
                    Err(e) => Err(self.fail(e)),
                }
            }
            _ => Err(self.fail(wrong_state())),
        }
    }

    fn transition(&mut self, to: State) {
        debug!(from = ?self.state, to = ?to, "state transition");
        self.state = to;
    }

    /// Record `err` (first error wins), enter [`State::Error`], and return
    /// the sticky first error.
    fn fail(&mut self, err: Error) -> Error {
        self.status.set(err);
        self.state = State::Error;
        match self.status.error() {
            Some(first) => first.clone(),
            None => Error::internal("failed context has ok status"),
        }
    }
}

fn wrong_state() -> Error {
    Error::client("wrong state")
}
