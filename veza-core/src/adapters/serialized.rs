//! Per-container serialization of runtime verbs.
//!
//! Wraps any [`ContainerRuntime`] so that at most one mutating or exec verb
//! is in flight per container name. Reads (`state`, `address`, `read_file`)
//! and interactive sessions pass straight through.

use crate::adapters::{ContainerRuntime, ExecOutput, RuntimeState};
use crate::error::Result;
use crate::locks::KeyedLocks;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

pub struct SerializedRuntime {
    inner: Arc<dyn ContainerRuntime>,
    locks: KeyedLocks,
}

impl SerializedRuntime {
    pub fn new(inner: Arc<dyn ContainerRuntime>) -> Self {
        Self { inner, locks: KeyedLocks::new() }
    }
}

#[async_trait]
impl ContainerRuntime for SerializedRuntime {
    async fn create(&self, name: &str, image: &str, bridge: &str) -> Result<()> {
        let _guard = self.locks.lock(name).await;
        self.inner.create(name, image, bridge).await
    }

    async fn start(&self, name: &str) -> Result<()> {
        let _guard = self.locks.lock(name).await;
        self.inner.start(name).await
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        let _guard = self.locks.lock(name).await;
        self.inner.stop(name, timeout).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.locks.lock(name).await;
        self.inner.delete(name).await
    }

    async fn state(&self, name: &str) -> Result<RuntimeState> {
        self.inner.state(name).await
    }

    async fn address(&self, name: &str) -> Result<Option<Ipv4Addr>> {
        self.inner.address(name).await
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        let _guard = self.locks.lock(name).await;
        self.inner.exec(name, command).await
    }

    async fn exec_streaming(
        &self,
        name: &str,
        command: &[String],
        lines: UnboundedSender<String>,
    ) -> Result<i32> {
        let _guard = self.locks.lock(name).await;
        self.inner.exec_streaming(name, command, lines).await
    }

    async fn push_file(&self, name: &str, local: &Path, remote: &str) -> Result<()> {
        let _guard = self.locks.lock(name).await;
        self.inner.push_file(name, local, remote).await
    }

    async fn write_file(&self, name: &str, remote: &str, contents: &[u8]) -> Result<()> {
        let _guard = self.locks.lock(name).await;
        self.inner.write_file(name, remote, contents).await
    }

    async fn read_file(&self, name: &str, remote: &str) -> Result<Option<Vec<u8>>> {
        self.inner.read_file(name, remote).await
    }

    async fn export(&self, name: &str, archive: &Path) -> Result<()> {
        let _guard = self.locks.lock(name).await;
        self.inner.export(name, archive).await
    }

    async fn import(&self, name: &str, archive: &Path) -> Result<()> {
        let _guard = self.locks.lock(name).await;
        self.inner.import(name, archive).await
    }

    async fn interactive(&self, name: &str, command: &[String]) -> Result<i32> {
        self.inner.interactive(name, command).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
