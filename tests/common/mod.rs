#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use tempfile::TempDir;
use tsumiki::{
    BuildEngine, BuildReport, Capabilities, CodecRegistry, EngineConfig, ExecutionParameters, LocalFiles, Task,
    TaskContext, TaskFactory, TaskIdentifier, Value, task_fn,
};

pub type Body = Arc<dyn Fn(&TaskContext, &Value) -> anyhow::Result<Value> + Send + Sync>;

#[derive(Clone)]
struct Definition {
    body: Body,
    capabilities: Capabilities,
    tokens: usize,
}

/// A factory whose behaviour is a closure registered under its tag, and whose
/// identity is the tag plus an arbitrary state value.
#[derive(Clone)]
pub struct FnFactory {
    tag: &'static str,
    state: Value,
    definition: Definition,
}

impl TaskFactory for FnFactory {
    fn tag(&self) -> &'static str {
        self.tag
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        Ok(self.state.clone())
    }

    fn create_task(&self) -> Box<dyn Task> {
        let body = self.definition.body.clone();
        let state = self.state.clone();
        task_fn(move |ctx| body(ctx, &state))
    }

    fn capabilities(&self) -> Capabilities {
        self.definition.capabilities
    }

    fn requested_tokens(&self) -> usize {
        self.definition.tokens
    }
}

/// The set of task kinds known to a test.
#[derive(Clone, Default)]
pub struct Tasks {
    definitions: Arc<Mutex<HashMap<&'static str, Definition>>>,
}

impl Tasks {
    pub fn define<F>(&self, tag: &'static str, body: F)
    where
        F: Fn(&TaskContext, &Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(tag, Arc::new(body), Capabilities::default(), 0);
    }

    pub fn define_short<F>(&self, tag: &'static str, body: F)
    where
        F: Fn(&TaskContext, &Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(tag, Arc::new(body), Capabilities::short(), 0);
    }

    pub fn define_with_tokens<F>(&self, tag: &'static str, tokens: usize, body: F)
    where
        F: Fn(&TaskContext, &Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(tag, Arc::new(body), Capabilities::default(), tokens);
    }

    fn insert(&self, tag: &'static str, body: Body, capabilities: Capabilities, tokens: usize) {
        let definition = Definition {
            body,
            capabilities,
            tokens,
        };
        self.definitions.lock().unwrap().insert(tag, definition);
    }

    pub fn factory(&self, tag: &'static str, state: Value) -> Arc<dyn TaskFactory> {
        let definition = self
            .definitions
            .lock()
            .unwrap()
            .get(tag)
            .cloned()
            .unwrap_or_else(|| panic!("task kind '{tag}' is not defined"));
        Arc::new(FnFactory { tag, state, definition })
    }

    /// A codec registry that can restore every defined kind.
    pub fn registry(&self) -> CodecRegistry {
        let mut registry = CodecRegistry::new();
        let tags: Vec<&'static str> = self.definitions.lock().unwrap().keys().copied().collect();
        for tag in tags {
            let tasks = self.clone();
            registry.register_factory_with(tag, move |state| Ok(tasks.factory(tag, state.clone())));
        }
        registry
    }
}

pub struct Fixture {
    _dir: TempDir,
    pub root: Utf8PathBuf,
    pub tasks: Tasks,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        Self {
            _dir: dir,
            root,
            tasks: Tasks::default(),
        }
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_database_path(self.root.join(".state").join("tasks.db"))
            .with_build_directory("build")
            .with_token_count(4)
            .with_worker_threads(8)
    }

    pub fn engine(&self) -> BuildEngine {
        self.engine_with(self.config())
    }

    pub fn engine_with(&self, config: EngineConfig) -> BuildEngine {
        BuildEngine::new(config, self.tasks.registry(), Arc::new(LocalFiles::new(self.root.clone())))
    }

    pub fn path(&self, relative: &str) -> Utf8PathBuf {
        self.root.join(relative)
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn remove(&self, relative: &str) {
        fs::remove_file(self.path(relative)).unwrap();
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.path(relative).exists()
    }
}

pub fn id(name: &str) -> TaskIdentifier {
    TaskIdentifier::new(name)
}

pub fn text(value: &str) -> Value {
    Value::Text(value.to_owned())
}

pub fn int(value: u64) -> Value {
    Value::Integer(value.into())
}

pub fn as_text(value: &Value) -> String {
    value.as_text().map(str::to_owned).unwrap_or_else(|| format!("{value:?}"))
}

pub fn build(engine: &BuildEngine, roots: Vec<(TaskIdentifier, Arc<dyn TaskFactory>)>) -> BuildReport {
    engine.execute(roots, ExecutionParameters::new()).unwrap()
}

pub fn names(ids: impl IntoIterator<Item = TaskIdentifier>) -> Vec<String> {
    let mut names: Vec<String> = ids.into_iter().map(|id| id.to_string()).collect();
    names.sort();
    names
}
