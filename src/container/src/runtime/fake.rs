//! Scripted in-memory runtime used by engine tests.
//!
//! Records every call it receives, so tests can assert on the exact
//! sequence of daemon operations a reconciliation pass issues, and can be
//! told to fail specific operations to exercise partial-failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::types::{ContainerConfig, ContainerState, ContainerStatus, File};

use super::{Runtime, RuntimeError};

/// Address reported for the fake daemon.
pub const ADDRESS: &str = "fake://";

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub state: Arc<Mutex<State>>,
}

impl PartialEq for Config {
    // The same shared daemon state means the same runtime.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Config {
    pub fn new(&self) -> FakeRuntime {
        FakeRuntime {
            state: self.state.clone(),
        }
    }

    /// Returns the recorded calls and clears the log.
    pub fn take_calls(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().unwrap().calls)
    }

    /// Drops a container from the daemon state without going through the
    /// runtime API, simulating an external removal.
    pub fn forget(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .containers
            .retain(|_, c| c.name != name);
    }

    pub fn fail_create(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_create
            .insert(name.to_string());
    }

    pub fn fail_copy(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_copy
            .insert(name.to_string());
    }

    pub fn container_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();

        let mut names: Vec<String> = state.containers.values().map(|c| c.name.clone()).collect();
        names.sort();

        names
    }
}

#[derive(Debug, Default)]
pub struct State {
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    fail_create: HashSet<String>,
    fail_copy: HashSet<String>,
    calls: Vec<String>,
}

#[derive(Debug)]
struct FakeContainer {
    name: String,
    image: String,
    state: ContainerState,
    files: Vec<File>,
}

pub struct FakeRuntime {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn create(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create {}", config.name));

        if state.fail_create.contains(&config.name) {
            return Err(RuntimeError::Runtime(format!(
                "creating {} refused by script",
                config.name
            )));
        }

        if state.containers.values().any(|c| c.name == config.name) {
            return Err(RuntimeError::NameConflict(config.name.clone()));
        }

        state.next_id += 1;
        let id = format!("id-{}", state.next_id);

        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: config.name.clone(),
                image: config.image.clone(),
                state: ContainerState::Created,
                files: Vec::new(),
            },
        );

        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("start {id}"));

        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        container.state = ContainerState::Running;

        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("stop {id}"));

        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        container.state = ContainerState::Stopped;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete {id}"));

        state.containers.remove(id);

        Ok(())
    }

    async fn status(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let state = self.state.lock().unwrap();

        match state.containers.get(id) {
            Some(container) => Ok(ContainerStatus {
                id: id.to_string(),
                name: container.name.clone(),
                image: container.image.clone(),
                state: container.state,
            }),
            None => Ok(ContainerStatus {
                state: ContainerState::Missing,
                ..Default::default()
            }),
        }
    }

    async fn read_files(&self, id: &str, paths: &[String]) -> Result<Vec<File>, RuntimeError> {
        let state = self.state.lock().unwrap();

        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        Ok(container
            .files
            .iter()
            .filter(|f| paths.contains(&f.path))
            .cloned()
            .collect())
    }

    async fn copy_files(&self, id: &str, files: &[File]) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("copy {id}"));

        let fail = state
            .containers
            .get(id)
            .map(|c| state.fail_copy.contains(&c.name))
            .unwrap_or(false);

        if fail {
            return Err(RuntimeError::Copy("copy refused by script".to_string()));
        }

        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        for file in files {
            container.files.retain(|f| f.path != file.path);
            container.files.push(file.clone());
        }

        Ok(())
    }
}
