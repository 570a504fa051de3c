// ============================================================================
// Document Store
// ============================================================================
//
// Namespaces map to collections held in `im` persistent structures, so a
// whole-store snapshot is an O(1) clone. Reads run against a `StoreState`;
// writes run inside a `Workspace` that records touched namespaces and the
// change events they produce.
//
// ============================================================================

use super::error::{ServiceError, ServiceResult};
use super::query::{UpdateSpec, apply_update, matches_filter, project, sort_documents};
use crate::core::document::{Document, DocumentExt, values_equal};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::SeqCst)
}

/// New `{"$oid": ...}` value.
pub fn new_object_id() -> Value {
    let uuid = uuid::Uuid::new_v4();
    let mut map = Document::new();
    map.insert("$oid".to_string(), Value::String(hex::encode(&uuid.as_bytes()[..12])));
    Value::Object(map)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    pub fn parse(full_name: &str) -> ServiceResult<Self> {
        match full_name.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(ServiceError::invalid_argument(format!(
                "Invalid namespace '{}'",
                full_name
            ))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexModel {
    pub name: String,
    pub keys: Document,
    pub unique: bool,
}

impl IndexModel {
    fn id_index() -> Self {
        let mut keys = Document::new();
        keys.insert("_id".to_string(), Value::from(1));
        Self {
            name: "_id_".to_string(),
            keys,
            unique: true,
        }
    }

    /// Default index name: `a_1_b_-1`.
    pub fn default_name(keys: &Document) -> String {
        keys.iter()
            .map(|(field, direction)| match direction {
                Value::String(s) => format!("{}_{}", field, s),
                other => format!("{}_{}", field, other),
            })
            .collect::<Vec<_>>()
            .join("_")
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("v".to_string(), Value::from(2));
        doc.insert("key".to_string(), Value::Object(self.keys.clone()));
        doc.insert("name".to_string(), Value::String(self.name.clone()));
        if self.unique && self.name != "_id_" {
            doc.insert("unique".to_string(), Value::Bool(true));
        }
        doc
    }

    fn key_of(&self, doc: &Document) -> Vec<Value> {
        self.keys
            .keys()
            .map(|field| doc.get_path(field).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct CollectionData {
    pub documents: im::Vector<Document>,
    pub indexes: Vec<IndexModel>,
    pub options: Document,
    pub version: u64,
}

impl CollectionData {
    fn new(options: Document) -> Self {
        Self {
            documents: im::Vector::new(),
            indexes: vec![IndexModel::id_index()],
            options,
            version: next_version(),
        }
    }

    /// Reject `candidate` if it collides with another document on a unique index.
    fn check_unique(&self, candidate: &Document, skip: Option<usize>) -> ServiceResult<()> {
        for index in self.indexes.iter().filter(|index| index.unique) {
            let key = index.key_of(candidate);
            let collision = self.documents.iter().enumerate().any(|(position, other)| {
                Some(position) != skip
                    && index
                        .key_of(other)
                        .iter()
                        .zip(key.iter())
                        .all(|(a, b)| values_equal(a, b))
            });
            if collision {
                return Err(ServiceError::duplicate_key(format!(
                    "E11000 duplicate key error collection index: {} dup key: {}",
                    index.name,
                    Value::Array(key)
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Change records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Replace => "replace",
            ChangeKind::Delete => "delete",
            ChangeKind::Drop => "drop",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub namespace: Namespace,
    pub kind: ChangeKind,
    pub document_id: Option<Value>,
    pub full_document: Option<Document>,
    pub update_description: Option<Document>,
}

fn describe_update(before: &Document, after: &Document) -> Document {
    let mut updated = Document::new();
    for (key, value) in after {
        if before.get(key).is_none_or(|old| !values_equal(old, value)) {
            updated.insert(key.clone(), value.clone());
        }
    }
    let removed: Vec<Value> = before
        .keys()
        .filter(|key| !after.contains_key(*key))
        .map(|key| Value::String(key.clone()))
        .collect();

    let mut description = Document::new();
    description.insert("updatedFields".to_string(), Value::Object(updated));
    description.insert("removedFields".to_string(), Value::Array(removed));
    description.insert("truncatedArrays".to_string(), Value::Array(Vec::new()));
    description
}

// ============================================================================
// Read side
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct FindSpec {
    pub filter: Document,
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub skip: u64,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreState {
    collections: im::OrdMap<Namespace, CollectionData>,
}

impl StoreState {
    pub fn collection(&self, ns: &Namespace) -> Option<&CollectionData> {
        self.collections.get(ns)
    }

    pub fn version_of(&self, ns: &Namespace) -> Option<u64> {
        self.collections.get(ns).map(|c| c.version)
    }

    pub fn database_names(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self.collections.keys().map(|ns| &ns.db).collect();
        names.into_iter().cloned().collect()
    }

    pub fn collection_names(&self, db: &str) -> Vec<String> {
        self.collections
            .keys()
            .filter(|ns| ns.db == db)
            .map(|ns| ns.coll.clone())
            .collect()
    }

    pub fn database_size(&self, db: &str) -> usize {
        self.collections
            .iter()
            .filter(|(ns, _)| ns.db == db)
            .map(|(_, data)| data.documents.len())
            .sum()
    }

    pub fn find(&self, ns: &Namespace, spec: &FindSpec) -> ServiceResult<Vec<Document>> {
        let Some(data) = self.collections.get(ns) else {
            return Ok(Vec::new());
        };
        let mut matched = Vec::new();
        for doc in data.documents.iter() {
            if matches_filter(doc, &spec.filter)? {
                matched.push(doc.clone());
            }
        }
        if let Some(sort) = &spec.sort {
            sort_documents(&mut matched, sort);
        }
        let limit = spec.limit.filter(|l| *l > 0).unwrap_or(u64::MAX);
        matched
            .into_iter()
            .skip(spec.skip as usize)
            .take(limit.min(usize::MAX as u64) as usize)
            .map(|doc| match &spec.projection {
                Some(projection) => project(&doc, projection),
                None => Ok(doc),
            })
            .collect()
    }

    pub fn all_documents(&self, ns: &Namespace) -> Vec<Document> {
        self.collections
            .get(ns)
            .map(|data| data.documents.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn indexes(&self, ns: &Namespace) -> ServiceResult<Vec<IndexModel>> {
        self.collections
            .get(ns)
            .map(|data| data.indexes.clone())
            .ok_or_else(|| ServiceError::namespace_not_found(ns))
    }
}

// ============================================================================
// Write side
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Value>,
    pub before: Option<Document>,
    pub after: Option<Document>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateMode<'a> {
    pub multi: bool,
    pub upsert: bool,
    pub sort: Option<&'a Document>,
}

/// Mutable view of a store; becomes visible only when published or committed.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    pub state: StoreState,
    pub changes: Vec<ChangeRecord>,
    pub touched: BTreeSet<Namespace>,
}

impl Workspace {
    pub fn new(state: StoreState) -> Self {
        Self {
            state,
            changes: Vec::new(),
            touched: BTreeSet::new(),
        }
    }

    /// Stamp every touched collection with a fresh version.
    pub fn restamp(&mut self) {
        for ns in &self.touched {
            if let Some(data) = self.state.collections.get_mut(ns) {
                data.version = next_version();
            }
        }
    }

    /// Overwrite (or remove) a collection wholesale.
    pub(crate) fn put_collection(&mut self, ns: &Namespace, data: Option<CollectionData>) {
        self.touched.insert(ns.clone());
        match data {
            Some(data) => {
                self.state.collections.insert(ns.clone(), data);
            }
            None => {
                self.state.collections.remove(ns);
            }
        }
    }

    fn collection_mut(&mut self, ns: &Namespace) -> &mut CollectionData {
        self.touched.insert(ns.clone());
        self.state
            .collections
            .entry(ns.clone())
            .or_insert_with(|| CollectionData::new(Document::new()))
    }

    pub fn create_collection(&mut self, ns: &Namespace, options: Document) -> ServiceResult<()> {
        if self.state.collections.contains_key(ns) {
            return Err(ServiceError::command(
                48,
                "NamespaceExists",
                format!("Collection already exists. NS: {}", ns),
            ));
        }
        self.touched.insert(ns.clone());
        self.state
            .collections
            .insert(ns.clone(), CollectionData::new(options));
        Ok(())
    }

    pub fn drop_collection(&mut self, ns: &Namespace) -> bool {
        self.touched.insert(ns.clone());
        let existed = self.state.collections.remove(ns).is_some();
        if existed {
            self.changes.push(ChangeRecord {
                namespace: ns.clone(),
                kind: ChangeKind::Drop,
                document_id: None,
                full_document: None,
                update_description: None,
            });
        }
        existed
    }

    pub fn drop_database(&mut self, db: &str) {
        let namespaces: Vec<Namespace> = self
            .state
            .collections
            .keys()
            .filter(|ns| ns.db == db)
            .cloned()
            .collect();
        for ns in namespaces {
            self.drop_collection(&ns);
        }
    }

    /// Insert documents in order, assigning `_id` where missing. Returns the ids.
    pub fn insert_many(
        &mut self,
        ns: &Namespace,
        docs: Vec<Document>,
    ) -> ServiceResult<Vec<Value>> {
        let mut ids = Vec::with_capacity(docs.len());
        for mut doc in docs {
            let id = match doc.get("_id") {
                Some(id) => id.clone(),
                None => {
                    let id = new_object_id();
                    let mut with_id = Document::new();
                    with_id.insert("_id".to_string(), id.clone());
                    with_id.extend(doc);
                    doc = with_id;
                    id
                }
            };
            let data = self.collection_mut(ns);
            data.check_unique(&doc, None)?;
            data.documents.push_back(doc.clone());
            self.changes.push(ChangeRecord {
                namespace: ns.clone(),
                kind: ChangeKind::Insert,
                document_id: Some(id.clone()),
                full_document: Some(doc),
                update_description: None,
            });
            ids.push(id);
        }
        Ok(ids)
    }

    fn matching_positions(
        &self,
        ns: &Namespace,
        filter: &Document,
        multi: bool,
        sort: Option<&Document>,
    ) -> ServiceResult<Vec<usize>> {
        let Some(data) = self.state.collections.get(ns) else {
            return Ok(Vec::new());
        };
        let mut positions = Vec::new();
        for (position, doc) in data.documents.iter().enumerate() {
            if matches_filter(doc, filter)? {
                positions.push(position);
            }
        }
        if let Some(sort) = sort {
            let mut keyed: Vec<Document> = positions
                .iter()
                .map(|p| {
                    let mut doc = data.documents[*p].clone();
                    doc.insert("__position".to_string(), Value::from(*p as u64));
                    doc
                })
                .collect();
            sort_documents(&mut keyed, sort);
            positions = keyed
                .iter()
                .filter_map(|doc| doc.get_i64("__position").map(|p| p as usize))
                .collect();
        }
        if !multi {
            positions.truncate(1);
        }
        Ok(positions)
    }

    pub fn update(
        &mut self,
        ns: &Namespace,
        filter: &Document,
        spec: &UpdateSpec,
        mode: UpdateMode<'_>,
    ) -> ServiceResult<UpdateOutcome> {
        let positions = self.matching_positions(ns, filter, mode.multi, mode.sort)?;
        let mut outcome = UpdateOutcome::default();

        if positions.is_empty() {
            if mode.upsert {
                let seed = upsert_seed(filter);
                let mut inserted = apply_update(&seed, spec, true)?;
                if !inserted.contains_key("_id") {
                    let mut with_id = Document::new();
                    with_id.insert("_id".to_string(), new_object_id());
                    with_id.extend(inserted);
                    inserted = with_id;
                }
                let ids = self.insert_many(ns, vec![inserted.clone()])?;
                outcome.upserted_id = ids.into_iter().next();
                outcome.after = Some(inserted);
            }
            return Ok(outcome);
        }

        let kind = match spec {
            UpdateSpec::Replacement(_) => ChangeKind::Replace,
            _ => ChangeKind::Update,
        };
        for position in positions {
            let data = self.collection_mut(ns);
            let before = data.documents[position].clone();
            let after = apply_update(&before, spec, false)?;
            if after.get("_id").zip(before.get("_id")).is_some_and(|(a, b)| !values_equal(a, b)) {
                return Err(ServiceError::command(
                    66,
                    "ImmutableField",
                    "Performing an update on the path '_id' would modify the immutable field '_id'",
                ));
            }
            outcome.matched += 1;
            if !values_equal(&Value::Object(before.clone()), &Value::Object(after.clone())) {
                data.check_unique(&after, Some(position))?;
                data.documents.set(position, after.clone());
                outcome.modified += 1;
                self.changes.push(ChangeRecord {
                    namespace: ns.clone(),
                    kind,
                    document_id: after.get("_id").cloned(),
                    full_document: Some(after.clone()),
                    update_description: (kind == ChangeKind::Update)
                        .then(|| describe_update(&before, &after)),
                });
            }
            if outcome.before.is_none() {
                outcome.before = Some(before);
                outcome.after = Some(after);
            }
        }
        Ok(outcome)
    }

    /// Delete matching documents and return them.
    pub fn delete(
        &mut self,
        ns: &Namespace,
        filter: &Document,
        multi: bool,
        sort: Option<&Document>,
    ) -> ServiceResult<Vec<Document>> {
        let mut positions = self.matching_positions(ns, filter, multi, sort)?;
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        positions.sort_unstable_by(|a, b| b.cmp(a));
        let data = self.collection_mut(ns);
        let mut removed: Vec<Document> = positions
            .into_iter()
            .map(|position| data.documents.remove(position))
            .collect();
        removed.reverse();
        for doc in &removed {
            self.changes.push(ChangeRecord {
                namespace: ns.clone(),
                kind: ChangeKind::Delete,
                document_id: doc.get("_id").cloned(),
                full_document: None,
                update_description: None,
            });
        }
        Ok(removed)
    }

    pub fn create_index(
        &mut self,
        ns: &Namespace,
        keys: Document,
        name: Option<String>,
        unique: bool,
    ) -> ServiceResult<String> {
        if keys.is_empty() {
            return Err(ServiceError::command(
                67,
                "CannotCreateIndex",
                "Index keys cannot be empty.",
            ));
        }
        let name = name.unwrap_or_else(|| IndexModel::default_name(&keys));
        let data = self.collection_mut(ns);
        if let Some(existing) = data.indexes.iter().find(|index| index.name == name) {
            if existing.keys == keys && existing.unique == unique {
                return Ok(name);
            }
            return Err(ServiceError::command(
                86,
                "IndexKeySpecsConflict",
                format!("An existing index has the same name as the requested index: {}", name),
            ));
        }
        let index = IndexModel {
            name: name.clone(),
            keys,
            unique,
        };
        data.indexes.push(index);
        if unique {
            let documents: Vec<Document> = data.documents.iter().cloned().collect();
            for (position, doc) in documents.iter().enumerate() {
                if let Err(err) = data.check_unique(doc, Some(position)) {
                    data.indexes.pop();
                    return Err(err);
                }
            }
        }
        Ok(name)
    }

    pub fn drop_index(&mut self, ns: &Namespace, name: &str) -> ServiceResult<()> {
        if name == "_id_" {
            return Err(ServiceError::command(72, "InvalidOptions", "cannot drop _id index"));
        }
        if !self.state.collections.contains_key(ns) {
            return Err(ServiceError::namespace_not_found(ns));
        }
        let data = self.collection_mut(ns);
        let before = data.indexes.len();
        data.indexes.retain(|index| index.name != name);
        if data.indexes.len() == before {
            return Err(ServiceError::command(
                27,
                "IndexNotFound",
                format!("index not found with name [{}]", name),
            ));
        }
        Ok(())
    }
}

/// Equality fields of a filter, used as the base document of an upsert.
fn upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') {
            continue;
        }
        match value {
            Value::Object(ops) if crate::core::document::is_operator_document(ops) => {
                if let Some(eq) = ops.get("$eq") {
                    seed.insert(key.clone(), eq.clone());
                }
            }
            other => {
                seed.insert(key.clone(), other.clone());
            }
        }
    }
    seed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::into_document;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        into_document(value).unwrap()
    }

    #[test]
    fn test_insert_assigns_id_and_enforces_uniqueness() {
        let ns = Namespace::new("db", "coll");
        let mut ws = Workspace::new(StoreState::default());
        let ids = ws.insert_many(&ns, vec![doc(json!({"x": 1}))]).unwrap();
        assert!(ids[0].get("$oid").is_some());

        ws.insert_many(&ns, vec![doc(json!({"_id": 1}))]).unwrap();
        let err = ws.insert_many(&ns, vec![doc(json!({"_id": 1}))]).unwrap_err();
        assert_eq!(err.code, Some(11000));
        assert_eq!(ws.changes.len(), 2);
    }

    #[test]
    fn test_update_upsert_and_describe() {
        let ns = Namespace::new("db", "coll");
        let mut ws = Workspace::new(StoreState::default());
        ws.insert_many(&ns, vec![doc(json!({"_id": 1, "x": 1}))]).unwrap();

        let spec = UpdateSpec::from_update(&json!({"$set": {"x": 2}})).unwrap();
        let outcome = ws
            .update(&ns, &doc(json!({"_id": 1})), &spec, UpdateMode::default())
            .unwrap();
        assert_eq!((outcome.matched, outcome.modified), (1, 1));
        let last = ws.changes.last().unwrap();
        assert_eq!(last.kind, ChangeKind::Update);
        assert_eq!(
            last.update_description.as_ref().unwrap()["updatedFields"],
            json!({"x": 2})
        );

        let upsert = UpdateMode {
            upsert: true,
            ..UpdateMode::default()
        };
        let outcome = ws.update(&ns, &doc(json!({"_id": 9})), &spec, upsert).unwrap();
        assert_eq!(outcome.upserted_id, Some(json!(9)));
        assert_eq!(ws.state.all_documents(&ns).len(), 2);
    }

    #[test]
    fn test_delete_with_sort_removes_first_in_order() {
        let ns = Namespace::new("db", "coll");
        let mut ws = Workspace::new(StoreState::default());
        let docs = (1..=3).map(|i| doc(json!({"_id": i}))).collect();
        ws.insert_many(&ns, docs).unwrap();
        let sort = doc(json!({"_id": -1}));
        let removed = ws.delete(&ns, &Document::new(), false, Some(&sort)).unwrap();
        assert_eq!(removed[0]["_id"], json!(3));
    }

    #[test]
    fn test_unique_index_rejects_existing_duplicates() {
        let ns = Namespace::new("db", "coll");
        let mut ws = Workspace::new(StoreState::default());
        let docs = vec![doc(json!({"_id": 1, "x": 1})), doc(json!({"_id": 2, "x": 1}))];
        ws.insert_many(&ns, docs).unwrap();
        let err = ws
            .create_index(&ns, doc(json!({"x": 1})), None, true)
            .unwrap_err();
        assert_eq!(err.code, Some(11000));
        assert_eq!(ws.state.indexes(&ns).unwrap().len(), 1);
    }
}
