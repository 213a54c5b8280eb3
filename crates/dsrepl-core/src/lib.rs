//! dsrepl-core: causal-ordering core of a multi-master directory
//! replication engine.
//!
//! This crate implements the pieces a supplier needs to decide, for a
//! given peer, which changes that peer is missing and in what order to
//! ship them — without depending on entry semantics, schema, access
//! control, or the changelog's on-disk format:
//!
//! - [`csn_generator`]: per-replica Change Sequence Number assignment,
//!   clock-skew tracking.
//! - [`pending_list`]: the ordered not-yet-committed/committed set a
//!   replica uses to compute a contiguous roll-up point.
//! - [`ruv`]: the Replica Update Vector, one per-origin summary of
//!   min/max CSNs observed, used to decide what a peer still needs.
//! - [`replica`]: ties a CSN generator and RUV to one local replica,
//!   with exclusive-access bookkeeping and tombstone reaping.
//! - [`wire`]: the `acquire_replica` request/response payloads and the
//!   per-operation replication control.
//! - [`changelog`]: the external-collaborator contract for replaying
//!   committed operations a peer's RUV doesn't yet cover.
//! - [`protocol`]: the incremental replication session state machine.
//! - [`config`]: per-replica configuration.

pub mod changelog;
pub mod config;
pub mod csn_generator;
pub mod pending_list;
pub mod protocol;
pub mod replica;
pub mod ruv;
pub mod wire;
