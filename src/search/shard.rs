//! A single physical shard backed by one tantivy index directory

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tantivy::collector::{Count, FacetCollector, TopDocs};
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, RegexQuery, TermQuery};
use tantivy::schema::{Facet, IndexRecordOption, OwnedValue, Term};
use tantivy::snippet::SnippetGenerator;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};
use tokio::sync::RwLock;

use crate::config::FieldType;
use crate::search::error::{SearchError, SearchResult};
use crate::search::mapping::{facet_field_name, IndexSchema, MappedField, DYNAMIC_FIELD};
use crate::search::query::{
    FacetBucket, FacetResult, HighlightRequest, QuerySpec, SearchHit, SearchRequest,
    SearchResponse, wildcard_to_regex,
};

/// One document handed to a batched shard write
#[derive(Debug, Clone)]
pub struct DocumentBatch {
    pub id: String,
    pub fields: Map<String, Value>,
}

/// A physical shard: one tantivy index directory, exclusively owned
pub struct ShardIndex {
    name: String,
    index: Index,
    index_schema: IndexSchema,
    writer: RwLock<IndexWriter>,
    reader: IndexReader,
}

impl ShardIndex {
    /// Open the shard directory if it exists, create it otherwise.
    ///
    /// A directory that exists but fails to open is fatal for the shard;
    /// it is never deleted or recreated here.
    pub fn open_or_create(
        base_path: &Path,
        name: &str,
        index_schema: IndexSchema,
        writer_heap: usize,
    ) -> SearchResult<Self> {
        let shard_path = base_path.join(name);

        let index = if shard_path.join("meta.json").exists() {
            Index::open_in_dir(&shard_path).map_err(|e| SearchError::ShardOpenFailed {
                shard: name.to_string(),
                message: e.to_string(),
            })?
        } else {
            std::fs::create_dir_all(&shard_path)?;
            Index::create_in_dir(&shard_path, index_schema.schema.clone()).map_err(|e| {
                SearchError::IndexInitFailed(format!("failed to create shard {}: {}", name, e))
            })?
        };

        let writer = index
            .writer(writer_heap.max(15_000_000))
            .map_err(|e| SearchError::IndexInitFailed(format!("failed to create writer: {}", e)))?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e: tantivy::TantivyError| {
                SearchError::IndexInitFailed(format!("failed to create reader: {}", e))
            })?;

        Ok(Self {
            name: name.to_string(),
            index,
            index_schema,
            writer: RwLock::new(writer),
            reader,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live documents
    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Write a batch keyed by document id. Existing documents with the same
    /// id are replaced, so re-indexing is idempotent. Durable on return.
    pub async fn index_documents(&self, docs: &[DocumentBatch]) -> SearchResult<usize> {
        let mut writer = self.writer.write().await;

        for doc in docs {
            let term = Term::from_field_text(self.index_schema.id_field, &doc.id);
            writer.delete_term(term);

            let tantivy_doc = self.to_tantivy_doc(&doc.id, &doc.fields);
            writer.add_document(tantivy_doc).map_err(|e| {
                SearchError::IndexingFailed(format!("failed to add document {}: {}", doc.id, e))
            })?;
        }

        writer
            .commit()
            .map_err(|e| SearchError::IndexingFailed(format!("failed to commit batch: {}", e)))?;
        drop(writer);

        self.reader.reload()?;
        Ok(docs.len())
    }

    /// Delete a document by id. Durable on return.
    pub async fn delete_document(&self, doc_id: &str) -> SearchResult<()> {
        let mut writer = self.writer.write().await;
        let term = Term::from_field_text(self.index_schema.id_field, doc_id);
        writer.delete_term(term);
        writer
            .commit()
            .map_err(|e| SearchError::DeletionFailed(format!("failed to commit deletion: {}", e)))?;
        drop(writer);

        self.reader.reload()?;
        Ok(())
    }

    /// Commit any buffered writes.
    pub async fn flush(&self) -> SearchResult<()> {
        let mut writer = self.writer.write().await;
        writer
            .commit()
            .map_err(|e| SearchError::IndexingFailed(format!("failed to flush: {}", e)))?;
        Ok(())
    }

    /// Execute a search against this shard alone.
    pub fn search(&self, request: &SearchRequest) -> SearchResult<SearchResponse> {
        let spec = QuerySpec::parse(&request.query)?;
        let query = self.compile_query(&spec)?;

        let searcher = self.reader.searcher();

        let size = if request.size == 0 { 10 } else { request.size };
        let collector = TopDocs::with_limit(size).and_offset(request.from);

        let top_docs = searcher
            .search(&*query, &collector)
            .map_err(|e| SearchError::SearchFailed(format!("search execution failed: {}", e)))?;

        let total = searcher
            .search(&*query, &Count)
            .map_err(|e| SearchError::SearchFailed(format!("count failed: {}", e)))?
            as u64;

        let highlighters = self.build_highlighters(&searcher, &*query, request.highlight.as_ref())?;

        let mut hits = Vec::with_capacity(top_docs.len());
        let mut max_score: f32 = 0.0;

        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| SearchError::SearchFailed(format!("failed to retrieve doc: {}", e)))?;

            if score > max_score {
                max_score = score;
            }

            let id = doc
                .get_first(self.index_schema.id_field)
                .and_then(owned_str)
                .unwrap_or_default();

            let highlight = self.highlight_doc(&highlighters, &doc);

            hits.push(SearchHit {
                id,
                score,
                source: self.doc_to_source(&doc),
                highlight,
            });
        }

        let facets = match &request.facets {
            Some(requests) if !requests.is_empty() => {
                Some(self.collect_facets(&searcher, &*query, requests)?)
            }
            _ => None,
        };

        Ok(SearchResponse {
            hits,
            total,
            facets,
            max_score,
            partial: false,
            failed_shards: Vec::new(),
        })
    }

    /// Translate a typed query spec into a tantivy query.
    pub fn compile_query(&self, spec: &QuerySpec) -> SearchResult<Box<dyn Query>> {
        match spec {
            QuerySpec::MatchAll => Ok(Box::new(AllQuery)),

            QuerySpec::Compound { must, should, must_not } => {
                let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
                for clause in must {
                    clauses.push((Occur::Must, self.compile_query(clause)?));
                }
                for clause in should {
                    clauses.push((Occur::Should, self.compile_query(clause)?));
                }
                for clause in must_not {
                    clauses.push((Occur::MustNot, self.compile_query(clause)?));
                }

                if clauses.is_empty() {
                    return Ok(Box::new(AllQuery));
                }

                // Pure negation needs a positive clause to subtract from.
                if clauses.iter().all(|(occur, _)| *occur == Occur::MustNot) {
                    clauses.push((Occur::Must, Box::new(AllQuery)));
                }

                Ok(Box::new(BooleanQuery::new(clauses)))
            }

            QuerySpec::Text { query, path: Some(path) } => match self.index_schema.mapped(path) {
                Some(mapped) => {
                    let parser = QueryParser::for_index(&self.index, vec![mapped.field]);
                    Ok(parser.parse_query(query)?)
                }
                None => self.dynamic_query(path, query),
            },

            QuerySpec::Text { query, path: None } => {
                let parser = QueryParser::for_index(
                    &self.index,
                    self.index_schema.default_search_fields.clone(),
                );
                Ok(parser.parse_query(query)?)
            }

            QuerySpec::Term { value, path } => match self.index_schema.mapped(path) {
                Some(mapped) => self.term_query(mapped, path, value),
                None if path == "_id" => Ok(Box::new(TermQuery::new(
                    Term::from_field_text(self.index_schema.id_field, value),
                    IndexRecordOption::Basic,
                ))),
                None => self.dynamic_query(path, &format!("\"{}\"", escape_quotes(value))),
            },

            QuerySpec::Wildcard { value, path } => {
                let mapped = self.index_schema.mapped(path).ok_or_else(|| {
                    SearchError::InvalidQuery(format!(
                        "wildcard requires a mapped field, {} is not mapped",
                        path
                    ))
                })?;

                let pattern = wildcard_to_regex(value);
                let query = RegexQuery::from_pattern(&pattern, mapped.field)
                    .map_err(|e| SearchError::InvalidQuery(format!("bad wildcard: {}", e)))?;
                Ok(Box::new(query))
            }
        }
    }

    fn term_query(
        &self,
        mapped: &MappedField,
        path: &str,
        value: &str,
    ) -> SearchResult<Box<dyn Query>> {
        let term = match mapped.field_type {
            FieldType::Text | FieldType::Keyword => Term::from_field_text(mapped.field, value),
            FieldType::Boolean => {
                let parsed = value.parse::<bool>().map_err(|_| {
                    SearchError::InvalidQuery(format!("term on boolean field {}: {}", path, value))
                })?;
                Term::from_field_bool(mapped.field, parsed)
            }
            FieldType::Numeric => {
                let parsed = value.parse::<f64>().map_err(|_| {
                    SearchError::InvalidQuery(format!("term on numeric field {}: {}", path, value))
                })?;
                Term::from_field_f64(mapped.field, parsed)
            }
            FieldType::Date => {
                return Err(SearchError::InvalidQuery(format!(
                    "term queries are not supported on date field {}",
                    path
                )))
            }
        };

        Ok(Box::new(TermQuery::new(term, IndexRecordOption::Basic)))
    }

    /// Query an unmapped path through the dynamic JSON field.
    fn dynamic_query(&self, path: &str, query_text: &str) -> SearchResult<Box<dyn Query>> {
        let dynamic = self.index_schema.dynamic_field.ok_or_else(|| {
            SearchError::InvalidQuery(format!("field {} is not mapped", path))
        })?;

        let parser = QueryParser::for_index(&self.index, vec![dynamic]);
        Ok(parser.parse_query(&format!("{}.{}:({})", DYNAMIC_FIELD, path, query_text))?)
    }

    fn build_highlighters(
        &self,
        searcher: &tantivy::Searcher,
        query: &dyn Query,
        highlight: Option<&HighlightRequest>,
    ) -> SearchResult<Vec<(String, SnippetGenerator)>> {
        let Some(highlight) = highlight else {
            return Ok(Vec::new());
        };

        let mut generators = Vec::new();
        for field_name in &highlight.fields {
            let Some(mapped) = self.index_schema.mapped(field_name) else {
                continue;
            };
            if mapped.field_type != FieldType::Text {
                continue;
            }

            let generator = SnippetGenerator::create(searcher, query, mapped.field)
                .map_err(|e| SearchError::SearchFailed(format!("highlighting failed: {}", e)))?;
            generators.push((field_name.clone(), generator));
        }

        Ok(generators)
    }

    fn highlight_doc(
        &self,
        highlighters: &[(String, SnippetGenerator)],
        doc: &TantivyDocument,
    ) -> Option<HashMap<String, Vec<String>>> {
        if highlighters.is_empty() {
            return None;
        }

        let mut fragments: HashMap<String, Vec<String>> = HashMap::new();
        for (field_name, generator) in highlighters {
            let snippet = generator.snippet_from_doc(doc);
            let html = snippet.to_html();
            if !html.is_empty() {
                fragments.insert(field_name.clone(), vec![html]);
            }
        }

        if fragments.is_empty() {
            None
        } else {
            Some(fragments)
        }
    }

    fn collect_facets(
        &self,
        searcher: &tantivy::Searcher,
        query: &dyn Query,
        requests: &HashMap<String, crate::search::query::FacetRequest>,
    ) -> SearchResult<HashMap<String, FacetResult>> {
        let mut results = HashMap::new();

        for (name, request) in requests {
            let Some(mapped) = self.index_schema.mapped(&request.field) else {
                tracing::warn!(field = %request.field, "Facet requested on unmapped field, skipping");
                continue;
            };
            if mapped.facet_field.is_none() {
                tracing::warn!(field = %request.field, "Facet requested on non-facet field, skipping");
                continue;
            }

            let root = format!("/{}", request.field);
            let mut collector = FacetCollector::for_field(facet_field_name(&request.field));
            collector.add_facet(Facet::from(root.as_str()));

            let counts = searcher.search(query, &collector).map_err(|e| {
                SearchError::SearchFailed(format!("facet aggregation failed: {}", e))
            })?;

            let mut buckets: Vec<FacetBucket> = counts
                .get(root.as_str())
                .map(|(facet, count)| FacetBucket {
                    key: facet
                        .to_string()
                        .rsplit('/')
                        .next()
                        .unwrap_or_default()
                        .to_string(),
                    count,
                })
                .collect();

            buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
            buckets.truncate(request.bucket_limit());

            results.insert(name.clone(), FacetResult { buckets });
        }

        Ok(results)
    }

    /// Convert a source JSON map into a tantivy document per the mapping.
    fn to_tantivy_doc(&self, id: &str, fields: &Map<String, Value>) -> TantivyDocument {
        let mut doc = TantivyDocument::new();
        doc.add_text(self.index_schema.id_field, id);

        let mut dynamic_rest: Map<String, Value> = Map::new();
        let mapped_sources: HashMap<&str, &MappedField> = self
            .index_schema
            .fields
            .values()
            .map(|m| (m.source_field.as_str(), m))
            .collect();

        for (key, value) in fields {
            if key == "_id" {
                continue;
            }

            match mapped_sources.get(key.as_str()) {
                Some(mapped) => add_mapped_value(&mut doc, mapped, value),
                None => {
                    if self.index_schema.dynamic_field.is_some() {
                        dynamic_rest.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        if let Some(dynamic) = self.index_schema.dynamic_field {
            if !dynamic_rest.is_empty() {
                let object: BTreeMap<String, OwnedValue> = dynamic_rest
                    .into_iter()
                    .map(|(key, value)| (key, OwnedValue::from(value)))
                    .collect();
                doc.add_object(dynamic, object);
            }
        }

        doc
    }

    /// Rebuild the stored source map from a retrieved document.
    fn doc_to_source(&self, doc: &TantivyDocument) -> Map<String, Value> {
        let mut source = Map::new();

        if let Some(id) = doc.get_first(self.index_schema.id_field).and_then(owned_str) {
            source.insert("_id".to_string(), Value::String(id));
        }

        for (name, mapped) in &self.index_schema.fields {
            let values: Vec<Value> = doc
                .get_all(mapped.field)
                .map(owned_to_json)
                .filter(|v| !v.is_null())
                .collect();

            match values.len() {
                0 => {}
                1 => {
                    source.insert(name.clone(), values.into_iter().next().unwrap());
                }
                _ => {
                    source.insert(name.clone(), Value::Array(values));
                }
            }
        }

        if let Some(dynamic) = self.index_schema.dynamic_field {
            if let Some(value) = doc.get_first(dynamic) {
                if let Value::Object(entries) = owned_to_json(value) {
                    for (key, value) in entries {
                        source.entry(key).or_insert(value);
                    }
                }
            }
        }

        source
    }
}

fn add_mapped_value(doc: &mut TantivyDocument, mapped: &MappedField, value: &Value) {
    // Arrays index each element into the same field.
    if let Value::Array(items) = value {
        for item in items {
            add_mapped_scalar(doc, mapped, item);
        }
        return;
    }
    add_mapped_scalar(doc, mapped, value);
}

fn add_mapped_scalar(doc: &mut TantivyDocument, mapped: &MappedField, value: &Value) {
    match mapped.field_type {
        FieldType::Text | FieldType::Keyword => {
            if let Some(text) = coerce_string(value) {
                doc.add_text(mapped.field, &text);
                if let Some(facet_field) = mapped.facet_field {
                    doc.add_facet(facet_field, facet_path(&mapped.name, &text));
                }
            }
        }
        FieldType::Numeric => {
            if let Some(number) = value.as_f64() {
                doc.add_f64(mapped.field, number);
                if let Some(facet_field) = mapped.facet_field {
                    doc.add_facet(facet_field, facet_path(&mapped.name, &format_number(number)));
                }
            }
        }
        FieldType::Date => {
            if let Some(datetime) = coerce_datetime(value) {
                doc.add_date(
                    mapped.field,
                    tantivy::DateTime::from_timestamp_millis(datetime.timestamp_millis()),
                );
                if let Some(facet_field) = mapped.facet_field {
                    doc.add_facet(facet_field, facet_path(&mapped.name, &datetime.to_rfc3339()));
                }
            }
        }
        FieldType::Boolean => {
            if let Some(flag) = value.as_bool() {
                doc.add_bool(mapped.field, flag);
                if let Some(facet_field) = mapped.facet_field {
                    doc.add_facet(facet_field, facet_path(&mapped.name, &flag.to_string()));
                }
            }
        }
    }
}

fn facet_path(field: &str, value: &str) -> Facet {
    Facet::from(format!("/{}/{}", field, value).as_str())
}

fn escape_quotes(value: &str) -> String {
    value.replace('"', "\\\"")
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

fn owned_str(value: &OwnedValue) -> Option<String> {
    match value {
        OwnedValue::Str(s) => Some(s.clone()),
        _ => None,
    }
}

fn owned_to_json(value: &OwnedValue) -> Value {
    match value {
        OwnedValue::Str(s) => Value::String(s.clone()),
        OwnedValue::U64(n) => Value::Number((*n).into()),
        OwnedValue::I64(n) => Value::Number((*n).into()),
        OwnedValue::F64(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        OwnedValue::Bool(b) => Value::Bool(*b),
        OwnedValue::Date(dt) => Utc
            .timestamp_millis_opt(dt.into_timestamp_millis())
            .single()
            .map(|dt| Value::String(dt.to_rfc3339()))
            .unwrap_or(Value::Null),
        OwnedValue::Facet(facet) => Value::String(facet.to_string()),
        OwnedValue::Array(items) => Value::Array(items.iter().map(owned_to_json).collect()),
        OwnedValue::Object(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), owned_to_json(value)))
                .collect(),
        ),
        _ => Value::Null,
    }
}
