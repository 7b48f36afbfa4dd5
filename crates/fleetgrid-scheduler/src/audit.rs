//! Audit path for plan and status changes.

use fleet_core::{GroupStatus, Version};
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    PlanChanged { from: Version, to: Version },
    StatusChanged(GroupStatus),
    GroupRemoved,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, group: &str, event: &AuditEvent);
}

/// Emits audit records as `tracing` events under `fleetgrid::audit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, group: &str, event: &AuditEvent) {
        match event {
            AuditEvent::PlanChanged { from, to } => {
                info!(target: "fleetgrid::audit", group, from = %from, to = %to, "plan changed");
            }
            AuditEvent::StatusChanged(status) => {
                let roles = status.roles.len();
                let ready = status.roles.values().filter(|r| r.ready).count();
                info!(
                    target: "fleetgrid::audit",
                    group,
                    version = %status.version,
                    phase = ?status.phase,
                    roles,
                    ready,
                    "status changed"
                );
            }
            AuditEvent::GroupRemoved => {
                info!(target: "fleetgrid::audit", group, "group removed");
            }
        }
    }
}
