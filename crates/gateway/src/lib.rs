//! `wsp-gateway`: the workspace proxy process.
//!
//! A [`node::ProxyNode`] owns every long-lived component (registration
//! loop, relay hub and mesh coordinator, app server, agent dialer); the
//! [`api`] module exposes it over HTTP and [`cli`] wires it to a config
//! file.

pub mod api;
pub mod apps;
pub mod bootstrap;
pub mod cli;
pub mod dialer;
pub mod health;
pub mod mesh;
pub mod node;
pub mod relay;
pub mod shutdown;
pub mod state;

pub use node::{NodeError, NodeOptions, NodeState, ProxyNode};
pub use shutdown::{ShutdownError, ShutdownStep};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use url::Url;
    use wsp_protocol::{
        AgentConnectionInfo, BuildInfoResponse, RegisterProxyRequest, RegisterProxyResponse,
    };
    use wsp_sdk::{PrimaryApi, SdkError};

    /// In-memory primary with scripted answers.
    pub struct FakePrimary {
        pub url: Url,
        pub build_info: Mutex<Result<BuildInfoResponse, SdkError>>,
        pub register: Mutex<Result<RegisterProxyResponse, SdkError>>,
        pub connection_info: Mutex<Result<AgentConnectionInfo, SdkError>>,
        /// Registrations never answer while set.
        pub register_hangs: AtomicBool,
        build_info_calls: AtomicU32,
        register_calls: AtomicU32,
        connection_info_calls: AtomicU32,
        releases: AtomicU32,
    }

    impl FakePrimary {
        pub fn new() -> Self {
            Self {
                url: Url::parse("https://primary.test").expect("static url"),
                build_info: Mutex::new(Ok(BuildInfoResponse {
                    version: env!("CARGO_PKG_VERSION").into(),
                    ..Default::default()
                })),
                register: Mutex::new(Ok(RegisterProxyResponse {
                    app_security_key: hex::encode([7u8; 96]),
                    derp_mesh_key: "mesh-key".into(),
                    derp_region_id: 999,
                    ..Default::default()
                })),
                connection_info: Mutex::new(Ok(AgentConnectionInfo::default())),
                register_hangs: AtomicBool::new(false),
                build_info_calls: AtomicU32::new(0),
                register_calls: AtomicU32::new(0),
                connection_info_calls: AtomicU32::new(0),
                releases: AtomicU32::new(0),
            }
        }

        pub fn build_info_calls(&self) -> u32 {
            self.build_info_calls.load(Ordering::SeqCst)
        }

        pub fn register_calls(&self) -> u32 {
            self.register_calls.load(Ordering::SeqCst)
        }

        pub fn connection_info_calls(&self) -> u32 {
            self.connection_info_calls.load(Ordering::SeqCst)
        }

        pub fn releases(&self) -> u32 {
            self.releases.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PrimaryApi for FakePrimary {
        async fn register(
            &self,
            _req: &RegisterProxyRequest,
        ) -> Result<RegisterProxyResponse, SdkError> {
            self.register_calls.fetch_add(1, Ordering::SeqCst);
            if self.register_hangs.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.register.lock().clone()
        }

        async fn build_info(&self) -> Result<BuildInfoResponse, SdkError> {
            self.build_info_calls.fetch_add(1, Ordering::SeqCst);
            self.build_info.lock().clone()
        }

        async fn agent_connection_info(&self) -> Result<AgentConnectionInfo, SdkError> {
            self.connection_info_calls.fetch_add(1, Ordering::SeqCst);
            self.connection_info.lock().clone()
        }

        fn release_idle_connections(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }

        fn primary_url(&self) -> &Url {
            &self.url
        }
    }
}
