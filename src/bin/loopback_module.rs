//! Loopback module binary: the smallest runnable integration, used by
//! the host's integration tests and as a worked example of the module
//! SDK. `DECKHOST_MOCK_VERSION` overrides the declared protocol version
//! so compatibility-gate behavior can be exercised end to end.

use module_plugin::message::PROTOCOL_VERSION;
use module_plugin::runtime::serve;
use module_plugin::test_util::MockModule;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let version =
        std::env::var("DECKHOST_MOCK_VERSION").unwrap_or_else(|_| PROTOCOL_VERSION.to_string());
    serve(MockModule::with_version(version)).await
}
