//! Translation of Atlas-style index definitions into tantivy schemas

use std::collections::HashMap;
use tantivy::schema::{
    FacetOptions, Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, FAST, INDEXED,
    STORED, STRING, TEXT,
};

use crate::config::{FieldType, IndexMappings};
use crate::search::error::{SearchError, SearchResult};

/// Catch-all JSON field that receives unmapped fields under dynamic mapping
pub const DYNAMIC_FIELD: &str = "_dynamic";

/// Tokenizers registered by tantivy that an index definition may name
const KNOWN_ANALYZERS: &[&str] = &["default", "raw", "en_stem", "whitespace"];

/// One declared field resolved against the built schema
#[derive(Debug, Clone)]
pub struct MappedField {
    /// Field in the tantivy schema, named after the mapping's `name`
    pub field: Field,

    /// Index-side name of the field
    pub name: String,

    /// Source document field this mapping reads from
    pub source_field: String,

    pub field_type: FieldType,

    /// Sibling hierarchical facet field, when the mapping declares `facet`
    pub facet_field: Option<Field>,
}

/// A built tantivy schema plus the lookup tables the engine needs at runtime
#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub schema: Schema,

    /// Raw string primary-key field (`_id`)
    pub id_field: Field,

    /// JSON catch-all for dynamic mappings
    pub dynamic_field: Option<Field>,

    /// Mapped fields keyed by their index-side name
    pub fields: HashMap<String, MappedField>,

    /// Fields the no-path text query searches across
    pub default_search_fields: Vec<Field>,
}

impl IndexSchema {
    /// Build the schema for one index definition. Unknown analyzers are a
    /// configuration error caught here, before any shard directory exists.
    pub fn build(mappings: &IndexMappings) -> SearchResult<Self> {
        let mut builder = Schema::builder();

        let id_field = builder.add_text_field("_id", STRING | STORED);

        let mut fields = HashMap::new();
        let mut default_search_fields = Vec::new();

        for mapping in &mappings.fields {
            let field_type = FieldType::parse(&mapping.field_type).ok_or_else(|| {
                SearchError::InvalidConfiguration(format!(
                    "field {}: unknown type {}",
                    mapping.name, mapping.field_type
                ))
            })?;

            let field = match field_type {
                FieldType::Text => {
                    let tokenizer = match mapping.analyzer.as_deref() {
                        None => "default",
                        Some(name) if KNOWN_ANALYZERS.contains(&name) => name,
                        Some(name) => {
                            return Err(SearchError::InvalidConfiguration(format!(
                                "field {}: unknown analyzer {}",
                                mapping.name, name
                            )))
                        }
                    };

                    let indexing = TextFieldIndexing::default()
                        .set_tokenizer(tokenizer)
                        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
                    let options = TextOptions::default()
                        .set_indexing_options(indexing)
                        .set_stored();
                    let field = builder.add_text_field(&mapping.name, options);
                    default_search_fields.push(field);
                    field
                }
                FieldType::Keyword => {
                    if mapping.analyzer.is_some() {
                        return Err(SearchError::InvalidConfiguration(format!(
                            "field {}: analyzer is only valid on text fields",
                            mapping.name
                        )));
                    }
                    builder.add_text_field(&mapping.name, STRING | STORED)
                }
                FieldType::Numeric => builder.add_f64_field(&mapping.name, INDEXED | STORED | FAST),
                FieldType::Date => builder.add_date_field(&mapping.name, INDEXED | STORED | FAST),
                FieldType::Boolean => builder.add_bool_field(&mapping.name, INDEXED | STORED),
            };

            let facet_field = mapping.facet.then(|| {
                builder.add_facet_field(&facet_field_name(&mapping.name), FacetOptions::default())
            });

            fields.insert(
                mapping.name.clone(),
                MappedField {
                    field,
                    name: mapping.name.clone(),
                    source_field: mapping.source_field().to_string(),
                    field_type,
                    facet_field,
                },
            );
        }

        let dynamic_field = mappings
            .dynamic
            .then(|| builder.add_json_field(DYNAMIC_FIELD, TEXT | STORED));

        if let Some(field) = dynamic_field {
            default_search_fields.push(field);
        }

        // A definition with no text fields still needs a parser target.
        if default_search_fields.is_empty() {
            default_search_fields.push(id_field);
        }

        Ok(Self {
            schema: builder.build(),
            id_field,
            dynamic_field,
            fields,
            default_search_fields,
        })
    }

    /// Mapped field by index-side name
    pub fn mapped(&self, name: &str) -> Option<&MappedField> {
        self.fields.get(name)
    }
}

/// Name of the hierarchical facet field shadowing a mapped field
pub fn facet_field_name(field: &str) -> String {
    format!("{}_facet", field)
}
