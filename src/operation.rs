//! Operation descriptors and the selection tree.
//!
//! Descriptors are produced by an external compiler and consumed here as read-only data. They
//! deserialize from JSON, where every selection node is tagged with a `kind`:
//!
//! ```json
//! {"kind": "LinkedField", "name": "node", "args": [{"name": "id", "value": {"literal": "123"}}],
//!  "selections": [{"kind": "ScalarField", "name": "name"}]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display},
    sync::Arc,
};

use crate::{
    error::StoreError,
    record::{DataId, ROOT_ID},
    storage_key::{
        argument_values, canonical_json, handle_field_name, handle_storage_key, storage_key,
        Argument, Variables,
    },
};

pub const CONNECTION_HANDLE: &str = "connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgumentDefinition {
    pub name: String,
    /// GraphQL type reference, e.g. `ID!` or `[String]`.
    #[serde(rename = "type")]
    pub type_ref: String,
    #[serde(default)]
    pub default_value: Option<Value>,
}

impl ArgumentDefinition {
    pub fn is_non_null(&self) -> bool {
        self.type_ref.ends_with('!')
    }
}

/// What happens when a field annotated as required is null or missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAction {
    /// Record the violation on the snapshot only.
    None,
    /// Record the violation and log it.
    Log,
    /// Abort the whole read.
    Throw,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalarField {
    #[serde(default)]
    pub alias: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Argument>,
    #[serde(default)]
    pub required: Option<RequiredAction>,
}

impl ScalarField {
    pub fn new<S: Into<String>>(name: S) -> Self {
        ScalarField {
            alias: None,
            name: name.into(),
            args: Vec::new(),
            required: None,
        }
    }

    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn storage_key(&self, variables: &Variables) -> String {
        storage_key(&self.name, &self.args, variables)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handle {
    pub handle: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub filters: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedField {
    #[serde(default)]
    pub alias: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Argument>,
    /// Set when the field's schema type is a concrete object type.
    #[serde(default)]
    pub concrete_type: Option<String>,
    #[serde(default)]
    pub plural: bool,
    #[serde(default)]
    pub required: Option<RequiredAction>,
    /// A handle maintains a client-side field alongside the server field. Readers read the handle
    /// field instead of the server field.
    #[serde(default)]
    pub handle: Option<Handle>,
    pub selections: Vec<Selection>,
}

impl LinkedField {
    pub fn new<S: Into<String>>(name: S, selections: Vec<Selection>) -> Self {
        LinkedField {
            alias: None,
            name: name.into(),
            args: Vec::new(),
            concrete_type: None,
            plural: false,
            required: None,
            handle: None,
            selections,
        }
    }

    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn storage_key(&self, variables: &Variables) -> String {
        storage_key(&self.name, &self.args, variables)
    }

    pub fn handle_key(&self, variables: &Variables) -> Option<String> {
        let handle = self.handle.as_ref()?;
        let name = handle_field_name(&handle.handle, handle.key.as_deref(), &self.name);
        Some(handle_storage_key(
            &name,
            &self.args,
            handle.filters.as_deref(),
            variables,
        ))
    }

    /// The key a reader should follow: the handle field if there is one, else the server field.
    pub fn read_storage_key(&self, variables: &Variables) -> String {
        self.handle_key(variables)
            .unwrap_or_else(|| self.storage_key(variables))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineFragment {
    pub type_condition: String,
    /// Present when `type_condition` is an interface or union; the normalizer writes a boolean
    /// under this key recording whether the record's concrete type implements it.
    #[serde(default)]
    pub abstract_key: Option<String>,
    /// Aliased inline fragments nest their data under the alias in the output.
    #[serde(default)]
    pub alias: Option<String>,
    pub selections: Vec<Selection>,
}

/// A named fragment with its own local argument definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderFragment {
    pub name: String,
    #[serde(default)]
    pub type_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub argument_definitions: Vec<ArgumentDefinition>,
    pub selections: Vec<Selection>,
    /// Any missing data or field error anywhere in the read fails the read.
    #[serde(default)]
    pub throw_on_field_error: bool,
}

impl ReaderFragment {
    pub fn new<S: Into<String>>(name: S, selections: Vec<Selection>) -> Self {
        ReaderFragment {
            name: name.into(),
            type_condition: None,
            argument_definitions: Vec::new(),
            selections,
            throw_on_field_error: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentSpread {
    /// Argument bindings passed to the fragment's local arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Argument>,
    pub fragment: Arc<ReaderFragment>,
    #[serde(default)]
    pub alias: Option<String>,
    /// Masked spreads read as a fragment reference instead of inlining the fragment's data.
    #[serde(default)]
    pub masked: bool,
}

impl FragmentSpread {
    /// Variables in scope inside the fragment: the outer variables, overridden by the spread's
    /// argument bindings, with the fragment's defaults filling anything left unbound.
    pub fn fragment_variables(&self, variables: &Variables) -> Variables {
        let mut scoped = variables.clone();
        for (name, value) in argument_values(&self.args, variables) {
            scoped.insert(name, value);
        }
        for def in self.fragment.argument_definitions.iter() {
            if !scoped.contains_key(&def.name) {
                scoped.insert(
                    def.name.clone(),
                    def.default_value.clone().unwrap_or(Value::Null),
                );
            }
        }
        scoped
    }

    /// The values of this fragment's local arguments, as recorded on fragment references.
    pub fn local_argument_values(&self, variables: &Variables) -> Variables {
        let scoped = self.fragment_variables(variables);
        self.fragment
            .argument_definitions
            .iter()
            .map(|def| {
                (
                    def.name.clone(),
                    scoped.get(&def.name).cloned().unwrap_or(Value::Null),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub condition: String,
    pub passing_value: bool,
    pub selections: Vec<Selection>,
}

impl Condition {
    pub fn passes(&self, variables: &Variables) -> bool {
        let value = variables
            .get(&self.condition)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        value == self.passing_value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Defer {
    pub label: String,
    /// Variable gating the deferral; an absent gate means always deferred.
    #[serde(default, rename = "if")]
    pub if_variable: Option<String>,
    pub selections: Vec<Selection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub label: String,
    #[serde(default, rename = "if")]
    pub if_variable: Option<String>,
    #[serde(default)]
    pub initial_count: usize,
    /// The single plural field being streamed.
    pub selections: Vec<Selection>,
}

fn gate_enabled(if_variable: &Option<String>, variables: &Variables) -> bool {
    match if_variable {
        Some(var) => variables.get(var).and_then(Value::as_bool).unwrap_or(false),
        None => true,
    }
}

impl Defer {
    pub fn is_enabled(&self, variables: &Variables) -> bool {
        gate_enabled(&self.if_variable, variables)
    }
}

impl Stream {
    pub fn is_enabled(&self, variables: &Variables) -> bool {
        gate_enabled(&self.if_variable, variables)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientExtension {
    pub selections: Vec<Selection>,
}

/// Shape of the value a resolver returns when it is a record rather than a scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverOutputType {
    pub concrete_type: String,
    pub normalization: Vec<Selection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverField {
    #[serde(default)]
    pub alias: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Argument>,
    /// Key of the resolver function in the resolver registry.
    pub resolver: String,
    /// Backing data handed to the resolver, read from the same record.
    #[serde(default)]
    pub fragment: Option<Arc<ReaderFragment>>,
    #[serde(default)]
    pub output_type: Option<ResolverOutputType>,
    /// Selections read from the resolver's output record, when it returns one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selections: Vec<Selection>,
}

impl ResolverField {
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn storage_key(&self, variables: &Variables) -> String {
        storage_key(&self.name, &self.args, variables)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDiscriminator {
    pub abstract_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Selection {
    ScalarField(ScalarField),
    LinkedField(LinkedField),
    InlineFragment(InlineFragment),
    FragmentSpread(FragmentSpread),
    Condition(Condition),
    Defer(Defer),
    Stream(Stream),
    ClientExtension(ClientExtension),
    Resolver(ResolverField),
    TypeDiscriminator(TypeDiscriminator),
}

impl Selection {
    pub fn scalar<S: Into<String>>(name: S) -> Self {
        Selection::ScalarField(ScalarField::new(name))
    }

    pub fn linked<S: Into<String>>(name: S, selections: Vec<Selection>) -> Self {
        Selection::LinkedField(LinkedField::new(name, selections))
    }

    /// Response keys this selection reads directly from the current response object, looking
    /// through fragments and conditions.
    pub fn response_keys(&self, out: &mut Vec<String>) {
        match self {
            Selection::ScalarField(field) => out.push(field.response_key().to_string()),
            Selection::LinkedField(field) => out.push(field.response_key().to_string()),
            Selection::InlineFragment(fragment) => {
                fragment.selections.iter().for_each(|s| s.response_keys(out))
            }
            Selection::FragmentSpread(spread) => spread
                .fragment
                .selections
                .iter()
                .for_each(|s| s.response_keys(out)),
            Selection::Condition(condition) => {
                condition.selections.iter().for_each(|s| s.response_keys(out))
            }
            Selection::Defer(defer) => defer.selections.iter().for_each(|s| s.response_keys(out)),
            Selection::Stream(stream) => {
                stream.selections.iter().for_each(|s| s.response_keys(out))
            }
            Selection::ClientExtension(_)
            | Selection::Resolver(_)
            | Selection::TypeDiscriminator(_) => {}
        }
    }
}

/// Compiled artifact for one query, mutation or subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDescriptor {
    pub name: String,
    #[serde(default)]
    pub kind: OperationKind,
    #[serde(default)]
    pub argument_definitions: Vec<ArgumentDefinition>,
    /// Selections used to shape read results; fragment boundaries preserved.
    pub read_selections: Vec<Selection>,
    /// Flattened selections used to normalize server responses.
    pub normalization_selections: Vec<Selection>,
    #[serde(default)]
    pub request_text: Option<String>,
    /// Abstract key to the concrete types implementing it.
    #[serde(default)]
    pub abstract_type_memberships: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub throw_on_field_error: bool,
}

impl OperationDescriptor {
    /// Build a descriptor whose read and normalization selections are the same tree.
    pub fn new<S: Into<String>>(name: S, kind: OperationKind, selections: Vec<Selection>) -> Self {
        OperationDescriptor {
            name: name.into(),
            kind,
            argument_definitions: Vec::new(),
            read_selections: selections.clone(),
            normalization_selections: selections,
            request_text: None,
            abstract_type_memberships: BTreeMap::new(),
            throw_on_field_error: false,
        }
    }

    pub fn from_json(value: Value) -> Result<Self, StoreError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn reader_fragment(&self) -> ReaderFragment {
        ReaderFragment {
            name: self.name.clone(),
            type_condition: None,
            argument_definitions: Vec::new(),
            selections: self.read_selections.clone(),
            throw_on_field_error: self.throw_on_field_error,
        }
    }

    /// Bind variables, filling defaults and rejecting missing non-null arguments.
    pub fn request(self: &Arc<Self>, variables: Variables) -> Result<OperationRequest, StoreError> {
        let mut bound = Map::new();
        for def in self.argument_definitions.iter() {
            let provided = variables.get(&def.name).filter(|value| !value.is_null());
            let value = match (provided, &def.default_value) {
                (Some(value), _) => value.clone(),
                (None, Some(default)) if !variables.contains_key(&def.name) => default.clone(),
                (None, _) if def.is_non_null() => {
                    return Err(StoreError::InvalidOperation(format!(
                        "Operation {} requires a value for ${} of type {}",
                        self.name, def.name, def.type_ref
                    )))
                }
                (None, _) => Value::Null,
            };
            bound.insert(def.name.clone(), value);
        }
        for (name, value) in variables.into_iter() {
            if !bound.contains_key(&name) {
                tracing::debug!("Operation {} received undeclared variable ${name}", self.name);
                bound.insert(name, value);
            }
        }
        let identifier = RequestIdentifier::new(self, &bound);
        Ok(OperationRequest {
            operation: Arc::clone(self),
            fragment: Arc::new(self.reader_fragment()),
            variables: bound,
            identifier,
        })
    }
}

/// Identity of an operation plus its variables, used to de-duplicate requests and as the owner
/// of snapshots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestIdentifier(String);

impl RequestIdentifier {
    pub fn new(operation: &OperationDescriptor, variables: &Variables) -> Self {
        let text = operation
            .request_text
            .as_deref()
            .unwrap_or(operation.name.as_str());
        let digest = Sha256::digest(text.as_bytes());
        RequestIdentifier(format!(
            "{}{}",
            hex::encode(digest),
            canonical_json(&Value::Object(variables.clone()))
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RequestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An operation bound to variables: what gets executed, retained and read.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub operation: Arc<OperationDescriptor>,
    pub fragment: Arc<ReaderFragment>,
    pub variables: Variables,
    pub identifier: RequestIdentifier,
}

impl OperationRequest {
    pub fn root_id(&self) -> DataId {
        DataId::from(ROOT_ID)
    }

    pub fn root_selector(&self) -> ReaderSelector {
        ReaderSelector {
            data_id: self.root_id(),
            fragment: Arc::clone(&self.fragment),
            variables: self.variables.clone(),
            owner: self.identifier.clone(),
        }
    }

    pub fn normalization_selections(&self) -> &[Selection] {
        &self.operation.normalization_selections
    }
}

/// Everything needed to read one fragment from one record.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderSelector {
    pub data_id: DataId,
    pub fragment: Arc<ReaderFragment>,
    pub variables: Variables,
    pub owner: RequestIdentifier,
}

pub const FRAGMENTS_KEY: &str = "__fragments";
pub const FRAGMENT_OWNER_KEY: &str = "__fragmentOwner";

impl ReaderSelector {
    /// Resolve a fragment reference produced by reading a masked spread.
    pub fn from_fragment_ref(
        fragment: Arc<ReaderFragment>,
        fragment_ref: &Value,
        variables: &Variables,
    ) -> Result<Self, StoreError> {
        let invalid = || {
            StoreError::InvalidOperation(format!(
                "Value is not a reference to fragment {}",
                fragment.name
            ))
        };
        let data_id = fragment_ref
            .get(crate::record::ID_KEY)
            .and_then(Value::as_str)
            .ok_or_else(invalid)?;
        let args = fragment_ref
            .get(FRAGMENTS_KEY)
            .and_then(|fragments| fragments.get(&fragment.name))
            .and_then(Value::as_object)
            .ok_or_else(invalid)?;
        let owner = fragment_ref
            .get(FRAGMENT_OWNER_KEY)
            .and_then(Value::as_str)
            .ok_or_else(invalid)?;
        let mut scoped = variables.clone();
        for (name, value) in args.iter() {
            scoped.insert(name.clone(), value.clone());
        }
        Ok(ReaderSelector {
            data_id: DataId::from(data_id),
            fragment,
            variables: scoped,
            owner: RequestIdentifier(owner.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_log::test;

    fn user_query() -> Arc<OperationDescriptor> {
        Arc::new(
            OperationDescriptor::from_json(json!({
                "name": "UserQuery",
                "argumentDefinitions": [
                    {"name": "id", "type": "ID!"},
                    {"name": "size", "type": "Int", "defaultValue": 32}
                ],
                "readSelections": [{
                    "kind": "LinkedField", "name": "node",
                    "args": [{"name": "id", "value": {"variable": "id"}}],
                    "selections": [{"kind": "ScalarField", "name": "name"}]
                }],
                "normalizationSelections": [{
                    "kind": "LinkedField", "name": "node",
                    "args": [{"name": "id", "value": {"variable": "id"}}],
                    "selections": [{"kind": "ScalarField", "name": "name"}]
                }]
            }))
            .unwrap(),
        )
    }

    #[test]
    fn request_fills_defaults_and_identifies_by_variables() {
        let op = user_query();
        let vars = json!({"id": "4"}).as_object().cloned().unwrap();
        let request = op.request(vars.clone()).unwrap();
        assert_eq!(request.variables.get("size"), Some(&json!(32)));

        let again = op.request(vars).unwrap();
        assert_eq!(request.identifier, again.identifier);

        let other = op
            .request(json!({"id": "5"}).as_object().cloned().unwrap())
            .unwrap();
        assert_ne!(request.identifier, other.identifier);
    }

    #[test]
    fn request_rejects_missing_non_null_argument() {
        let err = user_query().request(Variables::new()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
    }

    #[test]
    fn identifier_ignores_variable_order() {
        let op = user_query();
        let a = op
            .request(json!({"id": "1", "size": 2}).as_object().cloned().unwrap())
            .unwrap();
        let mut reordered = Variables::new();
        reordered.insert("size".into(), json!(2));
        reordered.insert("id".into(), json!("1"));
        let b = op.request(reordered).unwrap();
        assert_eq!(a.identifier, b.identifier);
    }

    #[test]
    fn fragment_variables_apply_bindings_then_defaults() {
        let spread = FragmentSpread {
            args: vec![Argument::literal("scale", json!(2))],
            fragment: Arc::new(ReaderFragment {
                argument_definitions: vec![
                    ArgumentDefinition {
                        name: "scale".into(),
                        type_ref: "Int".into(),
                        default_value: Some(json!(1)),
                    },
                    ArgumentDefinition {
                        name: "unit".into(),
                        type_ref: "String".into(),
                        default_value: Some(json!("px")),
                    },
                ],
                ..ReaderFragment::new("Avatar", vec![])
            }),
            alias: None,
            masked: true,
        };
        let local = spread.local_argument_values(&Variables::new());
        assert_eq!(local.get("scale"), Some(&json!(2)));
        assert_eq!(local.get("unit"), Some(&json!("px")));
    }

    #[test]
    fn handle_fields_read_from_the_handle_key() {
        let mut field = LinkedField::new("comments", vec![]);
        field.args = vec![Argument::literal("first", json!(2))];
        assert_eq!(field.read_storage_key(&Variables::new()), "comments(first:2)");
        field.handle = Some(Handle {
            handle: CONNECTION_HANDLE.to_string(),
            key: Some("Post_comments".to_string()),
            filters: Some(vec![]),
        });
        assert_eq!(
            field.read_storage_key(&Variables::new()),
            "__Post_comments_connection"
        );
    }
}
