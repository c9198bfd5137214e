use vigil_core::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("at least one candidate endpoint is required")]
    NoEndpoints,
    #[error("agent {agent_id} failed to connect: {source}")]
    Connect {
        agent_id: String,
        #[source]
        source: TransportError,
    },
    #[error("{failed} of {total} agents failed to connect: {details}")]
    Provision { failed: usize, total: usize, details: String },
}
