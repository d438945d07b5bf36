//! Scripted in-process plugin for tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use super::{
    error::PluginError,
    traits::{PluginHandle, SensorPlugin},
    types::{Capability, PluginIdentity, PluginOptions, PluginResult, Sample},
};

/// State shared between a [`ScriptedPlugin`], its handles and the test.
pub(crate) struct Script {
    reads: Mutex<VecDeque<PluginResult<Sample>>>,
    fallback: Mutex<PluginResult<Sample>>,
    read_delay: Mutex<Duration>,
    reads_taken: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl Script {
    /// Queues results returned by the next reads, in order.
    pub(crate) fn push_reads<I>(&self, results: I)
    where
        I: IntoIterator<Item = PluginResult<Sample>>,
    {
        self.reads.lock().unwrap().extend(results);
    }

    /// Result returned once the queue is empty.
    pub(crate) fn set_fallback(&self, result: PluginResult<Sample>) {
        *self.fallback.lock().unwrap() = result;
    }

    /// Every following read sleeps this long first.
    pub(crate) fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = delay;
    }

    pub(crate) fn reads_taken(&self) -> usize {
        self.reads_taken.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub(crate) struct ScriptedPlugin {
    identity: PluginIdentity,
    init_result: PluginResult<()>,
    init_delay: Duration,
    shutdown_result: PluginResult<()>,
    script: Arc<Script>,
}

impl ScriptedPlugin {
    /// A plugin that succeeds everywhere and reads `{"value": 1.0}`.
    pub(crate) fn new(name: &str) -> Self {
        Self {
            identity: PluginIdentity::new(name, "0.0.1"),
            init_result: Ok(()),
            init_delay: Duration::ZERO,
            shutdown_result: Ok(()),
            script: Arc::new(Script {
                reads: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(Ok(Sample::from_pairs([("value", 1.0)]))),
                read_delay: Mutex::new(Duration::ZERO),
                reads_taken: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.identity.capabilities = capabilities;
        self
    }

    pub(crate) fn failing_init(mut self, error: PluginError) -> Self {
        self.init_result = Err(error);
        self
    }

    pub(crate) fn init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    pub(crate) fn read_delay(self, delay: Duration) -> Self {
        self.script.set_read_delay(delay);
        self
    }

    pub(crate) fn failing_shutdown(mut self, error: PluginError) -> Self {
        self.shutdown_result = Err(error);
        self
    }

    pub(crate) fn script(&self) -> Arc<Script> {
        Arc::clone(&self.script)
    }

    pub(crate) fn shared(self) -> Arc<dyn SensorPlugin> {
        Arc::new(self)
    }
}

#[async_trait::async_trait]
impl SensorPlugin for ScriptedPlugin {
    async fn initialize(&self, _options: &PluginOptions) -> PluginResult<Box<dyn PluginHandle>> {
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        self.init_result.clone()?;
        Ok(Box::new(ScriptedHandle {
            plugin: self.clone(),
        }))
    }
}

struct ScriptedHandle {
    plugin: ScriptedPlugin,
}

#[async_trait::async_trait]
impl PluginHandle for ScriptedHandle {
    fn identify(&self) -> PluginIdentity {
        self.plugin.identity.clone()
    }

    async fn read_sample(&self) -> PluginResult<Sample> {
        let script = &self.plugin.script;
        let delay = *script.read_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        script.reads_taken.fetch_add(1, Ordering::SeqCst);
        let next = script.reads.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => script.fallback.lock().unwrap().clone(),
        }
    }

    async fn shutdown(&self) -> PluginResult<()> {
        self.plugin.script.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.plugin.shutdown_result.clone()
    }
}
