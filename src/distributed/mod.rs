//! Data-parallel replicas and the cross-replica collectives they share

pub mod collector;
pub mod communication;

pub use collector::{
    run_replicas, BarrierCollector, CollectorKind, GlobalCollector, IdentityCollector, ReplicaGroup,
};
pub use communication::ExchangeHub;
