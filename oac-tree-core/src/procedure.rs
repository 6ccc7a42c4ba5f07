use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::instruction::{reset_node, setup_tree, tick_node, InstructionRegistry};
use crate::status::ExecutionStatus;
use crate::tree::{InstructionDescription, InstructionTree, NodeId};
use crate::ui::UserInterface;
use crate::variable::VariableRegistry;
use crate::workspace::{CallbackGuard, Workspace};

// ─── Preamble ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeRegistrationMode {
    /// Payload is an inline JSON type definition.
    JsonString,
    /// Payload is a path to a JSON type file.
    JsonFile,
}

/// One type-registration entry of a procedure preamble.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypeRegistration {
    pub mode: TypeRegistrationMode,
    pub payload: String,
}

/// Type-registration info and plugin paths declared ahead of the workspace.
/// The core records the preamble; acting on it (loading plugins, seeding a
/// type registry) is the embedder's concern.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedurePreamble {
    pub type_registrations: Vec<TypeRegistration>,
    pub plugin_paths: Vec<String>,
}

// ─── Template ─────────────────────────────────────────────────

/// Parsed description of one workspace variable.
#[derive(Clone, Debug, PartialEq)]
pub struct VariableDescription {
    pub type_name: String,
    pub name: String,
    pub attributes: Vec<(String, String)>,
}

/// Parsed, instantiable description of a whole procedure file: variables,
/// top-level instructions and the preamble. Shared between a procedure and
/// the includes that reference it.
#[derive(Clone, Debug, Default)]
pub struct ProcedureTemplate {
    pub variables: Vec<VariableDescription>,
    pub instructions: Vec<InstructionDescription>,
    pub preamble: ProcedurePreamble,
}

impl ProcedureTemplate {
    /// Find a (possibly nested) instruction by name.
    pub fn find_instruction(&self, name: &str) -> Option<&InstructionDescription> {
        self.instructions
            .iter()
            .find_map(|description| description.find_named(name))
    }
}

// ─── Procedure store ──────────────────────────────────────────

struct StoreInner {
    templates: HashMap<PathBuf, Arc<ProcedureTemplate>>,
    site_ids: HashMap<String, u32>,
    next_site_id: u32,
    /// Include-site graph: an edge per include instantiation. A cycle means
    /// unbounded recursive instantiation.
    includes: DiGraphMap<u32, ()>,
}

/// Cache of parsed procedure files plus the include-instantiation graph used
/// to reject include cycles during setup.
pub struct ProcedureStore {
    inner: Mutex<StoreInner>,
}

impl ProcedureStore {
    pub fn new() -> Self {
        ProcedureStore {
            inner: Mutex::new(StoreInner {
                templates: HashMap::new(),
                site_ids: HashMap::new(),
                next_site_id: 0,
                includes: DiGraphMap::new(),
            }),
        }
    }

    /// Load and cache the template of a procedure file.
    pub fn load(&self, path: &Path) -> Result<Arc<ProcedureTemplate>, EngineError> {
        if let Some(template) = self.inner.lock().unwrap().templates.get(path) {
            return Ok(template.clone());
        }
        let template = Arc::new(crate::parser::template_from_file(path)?);
        self.inner
            .lock()
            .unwrap()
            .templates
            .insert(path.to_path_buf(), template.clone());
        Ok(template)
    }

    /// Record one include instantiation (`parent site → child site`) and fail
    /// when the graph becomes cyclic.
    pub fn record_include(&self, parent_site: &str, child_site: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let parent = Self::site_id(&mut inner, parent_site);
        let child = Self::site_id(&mut inner, child_site);
        inner.includes.add_edge(parent, child, ());
        if is_cyclic_directed(&inner.includes) {
            return Err(EngineError::ProcedureSetup(format!(
                "include cycle detected at '{child_site}'"
            )));
        }
        Ok(())
    }

    fn site_id(inner: &mut StoreInner, site: &str) -> u32 {
        if let Some(id) = inner.site_ids.get(site) {
            return *id;
        }
        let id = inner.next_site_id;
        inner.next_site_id += 1;
        inner.site_ids.insert(site.to_string(), id);
        id
    }
}

impl Default for ProcedureStore {
    fn default() -> Self {
        ProcedureStore::new()
    }
}

// ─── Procedure context ────────────────────────────────────────

/// Everything instruction setup needs to resolve references beyond its own
/// node: the owning file, its template, the registries and the include
/// store.
#[derive(Clone)]
pub struct ProcedureContext {
    pub filename: String,
    /// Identifies this instantiation in the include graph.
    pub include_site: String,
    pub template: Arc<ProcedureTemplate>,
    pub instruction_registry: Arc<InstructionRegistry>,
    pub variable_registry: Arc<VariableRegistry>,
    pub store: Arc<ProcedureStore>,
}

impl ProcedureContext {
    /// Context over an empty template with default registries; enough for
    /// procedures built programmatically.
    pub fn standalone() -> Self {
        ProcedureContext::for_template(Arc::new(ProcedureTemplate::default()), String::new())
    }

    pub fn for_template(template: Arc<ProcedureTemplate>, filename: String) -> Self {
        let include_site = filename.clone();
        ProcedureContext {
            filename,
            include_site,
            template,
            instruction_registry: Arc::new(InstructionRegistry::with_defaults()),
            variable_registry: Arc::new(VariableRegistry::with_defaults()),
            store: Arc::new(ProcedureStore::new()),
        }
    }

    /// Resolve a file reference relative to the directory of this file.
    pub fn resolve_path(&self, file: &str) -> PathBuf {
        let referenced = Path::new(file);
        if referenced.is_absolute() {
            return referenced.to_path_buf();
        }
        match Path::new(&self.filename).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(referenced),
            _ => referenced.to_path_buf(),
        }
    }

    /// Context for an included sub-procedure, sharing registries and store.
    pub fn subcontext(
        &self,
        filename: String,
        include_site: String,
        template: Arc<ProcedureTemplate>,
    ) -> ProcedureContext {
        ProcedureContext {
            filename,
            include_site,
            template,
            instruction_registry: self.instruction_registry.clone(),
            variable_registry: self.variable_registry.clone(),
            store: self.store.clone(),
        }
    }
}

/// Instantiate the workspace described by a template.
pub(crate) fn build_workspace(
    template: &ProcedureTemplate,
    registry: &VariableRegistry,
) -> Result<Workspace, EngineError> {
    let mut workspace = Workspace::new();
    for description in &template.variables {
        let mut variable = registry.create(&description.type_name).ok_or_else(|| {
            EngineError::Parse(format!(
                "unknown variable type '{}'",
                description.type_name
            ))
        })?;
        let attributes = variable.attributes_mut();
        for (name, value) in &description.attributes {
            if !attributes.add_string_attribute(name.clone(), value.clone()) {
                return Err(EngineError::Parse(format!(
                    "duplicate attribute '{name}' on variable '{}'",
                    description.name
                )));
            }
        }
        if !attributes.has_attribute(crate::attributes::NAME_ATTRIBUTE) {
            attributes.add_string_attribute(crate::attributes::NAME_ATTRIBUTE, &description.name);
        }
        if !attributes.validate() {
            return Err(EngineError::VariableSetup {
                name: description.name.clone(),
                details: attributes.failed_constraints().join("; "),
            });
        }
        workspace.add_variable(&description.name, variable)?;
    }
    Ok(workspace)
}

// ─── Procedure ────────────────────────────────────────────────

/// Root container of a job: the instruction tree, the workspace and the
/// preamble, loaded from one procedure file.
pub struct Procedure {
    tree: InstructionTree,
    workspace: Workspace,
    context: ProcedureContext,
    source_hash: Option<String>,
    ui_guard: Option<CallbackGuard>,
}

impl Procedure {
    /// Instantiate a procedure from a parsed template.
    pub fn from_template(
        template: ProcedureTemplate,
        filename: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let context = ProcedureContext::for_template(Arc::new(template), filename.into());
        let tree = InstructionTree::build(
            &context.template.instructions,
            &context.instruction_registry,
        )?;
        let workspace = build_workspace(&context.template, &context.variable_registry)?;
        Ok(Procedure {
            tree,
            workspace,
            context,
            source_hash: None,
            ui_guard: None,
        })
    }

    pub fn filename(&self) -> &str {
        &self.context.filename
    }

    pub fn preamble(&self) -> &ProcedurePreamble {
        &self.context.template.preamble
    }

    /// Hex SHA-256 of the procedure source, when parsed from text.
    pub fn source_hash(&self) -> Option<&str> {
        self.source_hash.as_deref()
    }

    pub(crate) fn set_source_hash(&mut self, hash: String) {
        self.source_hash = Some(hash);
    }

    pub fn tree(&self) -> &InstructionTree {
        &self.tree
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// The root instruction: the first top-level instruction.
    pub fn root_instruction(&self) -> Option<NodeId> {
        self.tree.root()
    }

    pub fn root_status(&self) -> ExecutionStatus {
        match self.tree.root() {
            Some(root) => self.tree.status_of(root),
            None => ExecutionStatus::NotStarted,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.root_status().is_finished()
    }

    /// The leaves the engine would tick next.
    pub fn next_leaves(&self) -> Vec<NodeId> {
        match self.tree.root() {
            Some(root) => self.tree.next_leaves(root),
            None => Vec::new(),
        }
    }

    /// Wire variable publication to the interface, set up the workspace in
    /// registration order, then set up the whole instruction tree.
    pub fn setup(&mut self, ui: Arc<dyn UserInterface>) -> Result<(), EngineError> {
        self.ui_guard = None;
        let listener = self.workspace.new_listener();
        let forward = ui.clone();
        self.workspace.register_generic_callback(
            move |name, value, connected| forward.variable_updated(name, value, connected),
            listener,
        );
        self.ui_guard = Some(self.workspace.callback_guard(listener));
        self.workspace.setup()?;
        setup_tree(&mut self.tree, &self.context)
    }

    /// Drop the interface wiring and tear the workspace down in reverse
    /// order.
    pub fn teardown(&mut self) {
        self.ui_guard = None;
        self.workspace.teardown();
    }

    /// Reset every top-level instruction subtree to NotStarted.
    pub(crate) fn reset_tree(&mut self, ui: &dyn UserInterface) {
        let roots: Vec<NodeId> = self.tree.roots().to_vec();
        for root in roots {
            reset_node(self.tree.slice(root), ui);
        }
    }

    /// Tick the root instruction once.
    pub(crate) async fn execute_root(
        &mut self,
        ui: &dyn UserInterface,
        halt: &AtomicBool,
    ) -> ExecutionStatus {
        let Some(root) = self.tree.root() else {
            return ExecutionStatus::Failure;
        };
        let workspace = &self.workspace;
        tick_node(self.tree.slice(root), ui, workspace, halt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingUi;
    use crate::tree::InstructionDescription;
    use serde_json::json;

    fn template_with_counter() -> ProcedureTemplate {
        ProcedureTemplate {
            variables: vec![VariableDescription {
                type_name: "Local".into(),
                name: "counter".into(),
                attributes: vec![("type".into(), "int32".into()), ("value".into(), "0".into())],
            }],
            instructions: vec![InstructionDescription::new("Sequence").with_child(
                InstructionDescription::new("Increment").with_attribute("varName", "counter"),
            )],
            preamble: ProcedurePreamble::default(),
        }
    }

    #[tokio::test]
    async fn procedure_sets_up_and_runs() {
        let ui: Arc<RecordingUi> = Arc::new(RecordingUi::new());
        let mut proc = Procedure::from_template(template_with_counter(), "test.xml").unwrap();
        proc.setup(ui.clone()).unwrap();
        // Initial variable values were published through the interface.
        assert!(ui
            .variable_updates
            .lock()
            .unwrap()
            .iter()
            .any(|(name, value, connected)| name == "counter" && *value == json!(0) && *connected));

        let halt = AtomicBool::new(false);
        let mut status = proc.execute_root(ui.as_ref(), &halt).await;
        while !status.is_finished() {
            status = proc.execute_root(ui.as_ref(), &halt).await;
        }
        assert_eq!(status, ExecutionStatus::Success);
        assert_eq!(proc.workspace().get_value("counter"), Some(json!(1)));
        assert!(proc.is_finished());
    }

    #[tokio::test]
    async fn reset_returns_tree_to_not_started() {
        let ui: Arc<RecordingUi> = Arc::new(RecordingUi::new());
        let mut proc = Procedure::from_template(template_with_counter(), "test.xml").unwrap();
        proc.setup(ui.clone()).unwrap();
        let halt = AtomicBool::new(false);
        while !proc.execute_root(ui.as_ref(), &halt).await.is_finished() {}
        proc.reset_tree(ui.as_ref());
        assert_eq!(proc.root_status(), ExecutionStatus::NotStarted);
        assert_eq!(proc.tree().status_of(1), ExecutionStatus::NotStarted);
    }

    #[test]
    fn unknown_variable_type_fails_instantiation() {
        let mut template = template_with_counter();
        template.variables[0].type_name = "Martian".into();
        assert!(Procedure::from_template(template, "test.xml").is_err());
    }

    #[test]
    fn include_cycles_are_detected() {
        let store = ProcedureStore::new();
        store.record_include("a.xml", "b.xml::Sub").unwrap();
        store.record_include("b.xml::Sub", "c.xml::Leaf").unwrap();
        let err = store.record_include("c.xml::Leaf", "a.xml").unwrap_err();
        assert!(matches!(err, EngineError::ProcedureSetup(_)));
        // Diamond shapes are fine.
        let store = ProcedureStore::new();
        store.record_include("a.xml", "b.xml::Sub").unwrap();
        store.record_include("a.xml", "c.xml::Sub").unwrap();
        store.record_include("b.xml::Sub", "d.xml::Leaf").unwrap();
        store.record_include("c.xml::Sub", "d.xml::Leaf").unwrap();
    }
}
