//! Starts every configured server and stops them together.
//!
//! Instances start concurrently. One that fails to start is reported as
//! `Failed` and the others keep serving.

use crate::model::Blueprint;
use crate::recorder::Sinks;
use crate::server::{InstanceState, ServerInstance};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

struct Managed {
    name: String,
    instance: Option<Arc<ServerInstance>>,
    state: watch::Receiver<InstanceState>,
}

pub struct Supervisor {
    servers: Vec<Managed>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    sinks: Arc<Sinks>,
    drain_timeout: Duration,
}

impl Supervisor {
    /// Launches one instance per server and returns once each is running or failed.
    pub async fn start(blueprint: &Blueprint, sinks: Arc<Sinks>, drain_timeout: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        let mut servers = Vec::with_capacity(blueprint.servers.len());

        for (index, spec) in blueprint.servers.iter().enumerate() {
            let mut name = spec.name();
            // Unaliased servers on port 0 can share a base url.
            if servers.iter().any(|s: &Managed| s.name == name) {
                name = format!("{}#{}", name, index);
            }
            match ServerInstance::from_spec(spec.clone(), Arc::clone(&sinks)) {
                Ok(instance) => {
                    let state = instance.subscribe();
                    tasks.spawn(Arc::clone(&instance).run(shutdown.clone(), drain_timeout));
                    servers.push(Managed {
                        name,
                        instance: Some(instance),
                        state,
                    });
                }
                Err(e) => {
                    error!(server = %name, error = %e, "Server starting error");
                    let (_, state) = watch::channel(InstanceState::Failed(e.to_string()));
                    servers.push(Managed {
                        name,
                        instance: None,
                        state,
                    });
                }
            }
        }

        let supervisor = Self {
            servers,
            shutdown,
            tasks,
            sinks,
            drain_timeout,
        };
        supervisor.wait_settled().await;
        info!(
            running = supervisor.running_count(),
            configured = supervisor.servers.len(),
            "Servers started"
        );
        supervisor
    }

    async fn wait_settled(&self) {
        for server in &self.servers {
            let mut state = server.state.clone();
            // A closed channel means the instance is gone; nothing to wait for.
            let _ = state.wait_for(InstanceState::is_settled).await;
        }
    }

    /// Current state of every configured server, in configuration order.
    ///
    /// Names are aliases or base urls; a repeated name gets `#<index>` appended.
    pub fn states(&self) -> Vec<(String, InstanceState)> {
        self.servers
            .iter()
            .map(|s| (s.name.clone(), s.state.borrow().clone()))
            .collect()
    }

    pub fn running(&self) -> bool {
        self.running_count() > 0
    }

    pub fn running_count(&self) -> usize {
        self.servers
            .iter()
            .filter(|s| *s.state.borrow() == InstanceState::Running)
            .count()
    }

    pub fn instance(&self, name: &str) -> Option<&Arc<ServerInstance>> {
        self.servers
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.instance.as_ref())
    }

    /// Address the named server actually listens on.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.instance(name).and_then(|i| i.local_addr())
    }

    /// Stops accepting, drains in-flight requests and pending records, flushes sinks.
    pub async fn shutdown(self) {
        info!("Shutting down servers");
        self.shutdown.cancel();
        self.tasks.close();

        // Each instance bounds its own drain; this is a backstop.
        let backstop = self.drain_timeout * 2 + Duration::from_secs(1);
        if tokio::time::timeout(backstop, self.tasks.wait())
            .await
            .is_err()
        {
            warn!("Some servers did not stop in time");
        }
        self.sinks.flush();

        for (name, state) in self.states() {
            info!(server = %name, state = ?state, "Final server state");
        }
    }
}
