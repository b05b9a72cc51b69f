use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::bytecode::{Chunk, ChunkId, ChunkKind};
use crate::compiler::{CompileError, compile_source};
use crate::host::HostRegistry;

/// Immutable result of compiling one script source. A failed compile still
/// produces a definition (with `valid == false` and the errors attached) so
/// diagnostics can keep naming the script.
#[derive(Debug)]
pub struct ScriptDefinition {
    pub name: String,
    /// Chunk arena; parents and handlers refer to slots in here.
    pub chunks: Vec<Chunk>,
    pub global: ChunkId,
    /// States and top-level functions by bare name. Event handlers inside a
    /// state are reached through that state's handler list instead.
    pub by_name: HashMap<String, ChunkId>,
    pub valid: bool,
    pub errors: Vec<CompileError>,
}

impl ScriptDefinition {
    /// Assembles the lookup map from a finished arena. Chunk 0 is the global
    /// chunk by construction.
    pub fn from_chunks(name: impl Into<String>, chunks: Vec<Chunk>) -> Self {
        let global: ChunkId = 0;
        let mut by_name = HashMap::new();
        for (event_name, id) in &chunks[global].handlers {
            by_name.insert(event_name.clone(), *id);
        }
        ScriptDefinition {
            name: name.into(),
            chunks,
            global,
            by_name,
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(name: impl Into<String>, errors: Vec<CompileError>) -> Self {
        let name = name.into();
        let chunks = vec![Chunk::new(name.clone(), ChunkKind::Global, None)];
        ScriptDefinition {
            name,
            chunks,
            global: 0,
            by_name: HashMap::new(),
            valid: false,
            errors,
        }
    }

    pub fn chunk(&self, id: ChunkId) -> &Chunk {
        &self.chunks[id]
    }

    pub fn initial_state(&self) -> Option<ChunkId> {
        self.chunks
            .iter()
            .position(|c| c.kind == ChunkKind::State && c.is_initial_state)
    }

    pub fn find_state(&self, name: &str) -> Option<ChunkId> {
        self.by_name
            .get(name)
            .copied()
            .filter(|id| self.chunks[*id].kind == ChunkKind::State)
    }

    /// Top-level functions only.
    pub fn find_function(&self, name: &str) -> Option<ChunkId> {
        self.by_name
            .get(name)
            .copied()
            .filter(|id| self.chunks[*id].kind == ChunkKind::Event)
    }

    pub fn states(&self) -> impl Iterator<Item = (&str, ChunkId)> {
        self.by_name
            .iter()
            .filter(|(_, id)| self.chunks[**id].kind == ChunkKind::State)
            .map(|(name, id)| (name.as_str(), *id))
    }

    pub fn functions(&self) -> impl Iterator<Item = (&str, ChunkId)> {
        self.by_name
            .iter()
            .filter(|(_, id)| self.chunks[**id].kind == ChunkKind::Event)
            .map(|(name, id)| (name.as_str(), *id))
    }

    /// Event handler owned by the given chunk, by bare name.
    pub fn handler_of(&self, owner: ChunkId, event: &str) -> Option<ChunkId> {
        self.chunks[owner]
            .handlers
            .iter()
            .find(|(name, _)| name == event)
            .map(|(_, id)| *id)
    }

    /// Dispatch order for calls and fired events: the active state's own
    /// handlers win over top-level functions.
    pub fn resolve_event(&self, active_state: Option<ChunkId>, name: &str) -> Option<ChunkId> {
        active_state
            .and_then(|state| self.handler_of(state, name))
            .or_else(|| self.find_function(name))
    }

    /// Source-line tables keyed by qualified chunk name, for tooling.
    pub fn line_tables(&self) -> HashMap<String, Vec<(u32, u32)>> {
        self.chunks
            .iter()
            .map(|c| (c.qualified_name(&self.chunks), c.lines.clone()))
            .collect()
    }
}

// ── Script library ───────────────────────────────────────────────────

/// Compile-once cache, keyed by script name and by source path. Host-owned;
/// sharing across components happens through the `Rc`s handed out here.
#[derive(Default)]
pub struct ScriptLibrary {
    by_name: HashMap<String, Rc<ScriptDefinition>>,
    by_path: HashMap<PathBuf, Rc<ScriptDefinition>>,
}

impl ScriptLibrary {
    pub fn new() -> Self {
        ScriptLibrary::default()
    }

    /// Compiles in-memory source and caches it under `name`. Check `valid`
    /// on the result before instantiating components from it.
    pub fn insert_source(
        &mut self,
        name: &str,
        source: &str,
        host: &dyn HostRegistry,
    ) -> Rc<ScriptDefinition> {
        let def = Rc::new(compile_source(name, source, host));
        self.by_name.insert(name.to_string(), Rc::clone(&def));
        def
    }

    /// Loads and compiles a script file, reusing the cache on repeat calls.
    /// The script name is the file stem.
    pub fn load_file(
        &mut self,
        path: &Path,
        host: &dyn HostRegistry,
    ) -> io::Result<Rc<ScriptDefinition>> {
        if let Some(def) = self.by_path.get(path) {
            return Ok(Rc::clone(def));
        }
        self.compile_path(path, host)
    }

    /// Recompiles from disk and replaces the cache entry. Components keep
    /// their old `Rc` until rebound.
    pub fn reload(
        &mut self,
        path: &Path,
        host: &dyn HostRegistry,
    ) -> io::Result<Rc<ScriptDefinition>> {
        self.compile_path(path, host)
    }

    fn compile_path(
        &mut self,
        path: &Path,
        host: &dyn HostRegistry,
    ) -> io::Result<Rc<ScriptDefinition>> {
        let source = std::fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("script")
            .to_string();
        let def = Rc::new(compile_source(&name, &source, host));
        self.by_name.insert(name, Rc::clone(&def));
        self.by_path.insert(path.to_path_buf(), Rc::clone(&def));
        Ok(def)
    }

    pub fn get(&self, name: &str) -> Option<Rc<ScriptDefinition>> {
        self.by_name.get(name).cloned()
    }

    pub fn get_path(&self, path: &Path) -> Option<Rc<ScriptDefinition>> {
        self.by_path.get(path).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}
