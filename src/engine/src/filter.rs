//! Layer-selection filters for unpacking.
//!
//! Filters take the form `<type1>,<type2>[:<name1>,<name2>]`. Types select
//! layer kinds; names (optional) narrow the selection to entries whose name
//! or path is listed.

use std::fmt;
use std::str::FromStr;

use kitforge_core::{KitError, Result};

use crate::kitfile::{Code, Dataset, Docs, Model, ModelPart, Prompt};

/// Layer kinds a filter can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    Kitfile,
    Model,
    Datasets,
    Code,
    Prompts,
    Docs,
}

impl FilterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterType::Kitfile => "kitfile",
            FilterType::Model => "model",
            FilterType::Datasets => "datasets",
            FilterType::Code => "code",
            FilterType::Prompts => "prompts",
            FilterType::Docs => "docs",
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterType {
    type Err = KitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kitfile" => Ok(FilterType::Kitfile),
            "model" => Ok(FilterType::Model),
            "datasets" => Ok(FilterType::Datasets),
            "code" => Ok(FilterType::Code),
            "prompts" => Ok(FilterType::Prompts),
            "docs" => Ok(FilterType::Docs),
            _ => Err(KitError::InvalidFilter(format!(
                "invalid filter type {} (must be one of kitfile, model, datasets, code, prompts, docs)",
                s
            ))),
        }
    }
}

/// Filter configuration: the selected layer kinds plus an optional name/path
/// allowlist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterConf {
    pub base_types: Vec<FilterType>,
    pub names: Vec<String>,
}

impl FilterConf {
    pub fn matches_base_type(&self, base_type: FilterType) -> bool {
        self.base_types.contains(&base_type)
    }

    fn matches_name(&self, name: &str) -> bool {
        // By default everything matches
        self.names.is_empty() || self.names.iter().any(|n| n == name)
    }

    fn matches(&self, base_type: FilterType, name: &str) -> bool {
        self.matches_base_type(base_type) && self.matches_name(name)
    }
}

/// Parse a filter string into a `FilterConf`.
pub fn parse_filter(filter: &str) -> Result<FilterConf> {
    let parts: Vec<&str> = filter.split(':').collect();
    if parts.len() > 2 {
        return Err(KitError::InvalidFilter(
            "should be in format <type1>,<type2>[:<filter1>,<filter2>]".to_string(),
        ));
    }

    let mut conf = FilterConf::default();
    for filter_type in parts[0].split(',') {
        conf.base_types.push(filter_type.parse()?);
    }

    if parts.len() == 2 {
        conf.names = parts[1].split(',').map(str::to_string).collect();
    }
    Ok(conf)
}

/// Build a single filter from the boolean selection flags.
pub fn filters_from_flags(
    kitfile: bool,
    models: bool,
    code: bool,
    datasets: bool,
    docs: bool,
) -> Vec<FilterConf> {
    let mut conf = FilterConf::default();
    if kitfile {
        conf.base_types.push(FilterType::Kitfile);
    }
    if models {
        conf.base_types.push(FilterType::Model);
    }
    if docs {
        conf.base_types.push(FilterType::Docs);
    }
    if datasets {
        conf.base_types.push(FilterType::Datasets);
    }
    if code {
        conf.base_types.push(FilterType::Code);
    }
    vec![conf]
}

/// A Kitfile entry a filter is matched against.
#[derive(Debug, Clone, Copy)]
pub enum FilterTarget<'a> {
    Kitfile,
    Model(&'a Model),
    ModelPart(&'a ModelPart),
    Dataset(&'a Dataset),
    Code(&'a Code),
    Prompt(&'a Prompt),
    Docs(&'a Docs),
}

/// Decide whether an entry should be unpacked given a set of filters. An
/// empty filter set unpacks everything.
pub fn should_unpack(target: FilterTarget<'_>, filters: &[FilterConf]) -> bool {
    if filters.is_empty() {
        return true;
    }
    match target {
        FilterTarget::Kitfile => filters
            .iter()
            .any(|f| f.matches_base_type(FilterType::Kitfile)),
        FilterTarget::Model(model) => {
            matches_any(FilterType::Model, model.name.as_deref(), &model.path, filters)
        }
        FilterTarget::ModelPart(part) => {
            matches_any(FilterType::Model, part.name.as_deref(), &part.path, filters)
        }
        FilterTarget::Dataset(dataset) => matches_any(
            FilterType::Datasets,
            dataset.name.as_deref(),
            &dataset.path,
            filters,
        ),
        // Code, prompts, and docs have no name field: match on path only
        FilterTarget::Code(code) => matches_any(FilterType::Code, None, &code.path, filters),
        FilterTarget::Prompt(prompt) => {
            matches_any(FilterType::Prompts, None, &prompt.path, filters)
        }
        FilterTarget::Docs(docs) => matches_any(FilterType::Docs, None, &docs.path, filters),
    }
}

fn matches_any(
    base_type: FilterType,
    name: Option<&str>,
    path: &str,
    filters: &[FilterConf],
) -> bool {
    filters.iter().any(|f| {
        name.map(|n| f.matches(base_type, n)).unwrap_or(false) || f.matches(base_type, path)
    })
}

/// Tighten filters for a parent modelkit: only model layers are inherited.
///
/// Returns `None` when the filters exclude base type `model` entirely, in
/// which case nothing should be unpacked from the parent.
pub fn restrict_to_model(filters: &[FilterConf]) -> Option<Vec<FilterConf>> {
    if filters.is_empty() {
        return Some(vec![FilterConf {
            base_types: vec![FilterType::Model],
            names: Vec::new(),
        }]);
    }
    let restricted: Vec<FilterConf> = filters
        .iter()
        .filter(|f| f.matches_base_type(FilterType::Model))
        .map(|f| FilterConf {
            base_types: vec![FilterType::Model],
            names: f.names.clone(),
        })
        .collect();
    if restricted.is_empty() {
        None
    } else {
        Some(restricted)
    }
}
