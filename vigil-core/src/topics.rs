//! Topic naming shared by agents and the aggregator.

/// Shared telemetry topic, all agents to the aggregator.
pub const TELEMETRY_TOPIC: &str = "data/stream";

/// Subscription filter covering every agent's presence topic.
pub const PRESENCE_FILTER: &str = "presence/+";

const PRESENCE_PREFIX: &str = "presence/";
const REPLY_PREFIX: &str = "response/";

/// Reply channel, aggregator to one agent.
pub fn reply_topic(agent_id: &str) -> String {
    format!("{REPLY_PREFIX}{agent_id}")
}

pub fn presence_topic(agent_id: &str) -> String {
    format!("{PRESENCE_PREFIX}{agent_id}")
}

/// Extracts the agent id from `presence/{agent_id}`.
pub fn presence_agent(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(PRESENCE_PREFIX)
        .filter(|id| !id.is_empty() && !id.contains('/'))
}
