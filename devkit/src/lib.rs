/*!
# Vigil DevKit - mocks and helpers for development

- Mock transport and mock network, no broker needed
- Wire payload builders
- Test harness with temporary snapshot paths
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockMessage, MockNetwork, MockTransport, VigilMessageBuilder};
pub use test_utils::TestHarness;
