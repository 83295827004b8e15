//! Job kind descriptors and registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use jobs_core::{
    DEFAULT_TIMEOUT_SECS, FieldSpec, FieldType, JobKind, ParamSchema, QueueName,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Command line run for one job. Arguments may contain the placeholders
/// `{params}`, `{output}`, `{workdir}` and `{job_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Format an analysis writes its result in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Json,
    #[default]
    Text,
    Graphml,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Text => "txt",
            OutputFormat::Graphml => "graphml",
        }
    }
}

/// Everything needed to accept and run one kind of analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindDescriptor {
    pub kind: JobKind,
    #[serde(default)]
    pub queue: QueueName,
    pub command: CommandTemplate,
    #[serde(default)]
    pub schema: ParamSchema,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub output: OutputFormat,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl KindDescriptor {
    pub fn new(kind: impl Into<JobKind>, command: CommandTemplate) -> Self {
        Self {
            kind: kind.into(),
            queue: QueueName::default_queue(),
            command,
            schema: ParamSchema::default(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            output: OutputFormat::Text,
        }
    }

    pub fn with_queue(mut self, queue: QueueName) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_schema(mut self, schema: ParamSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_output(mut self, output: OutputFormat) -> Self {
        self.output = output;
        self
    }
}

/// Registry mapping kinds to their descriptors.
#[derive(Debug, Default)]
pub struct KindRegistry {
    kinds: HashMap<JobKind, Arc<KindDescriptor>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any previous one for the same kind.
    pub fn register(&mut self, descriptor: KindDescriptor) {
        self.kinds
            .insert(descriptor.kind.clone(), Arc::new(descriptor));
    }

    pub fn get(&self, kind: &JobKind) -> Option<Arc<KindDescriptor>> {
        self.kinds.get(kind).cloned()
    }

    pub fn contains(&self, kind: &JobKind) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Registered kinds in name order.
    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.kinds.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// The NeDRex analyses, each run as `python3 <scripts_dir>/<kind>.py`.
    pub fn nedrex_defaults(scripts_dir: &Path) -> Self {
        let mut registry = Self::new();
        let command = |kind: &str| CommandTemplate {
            program: "python3".to_string(),
            args: vec![
                scripts_dir.join(format!("{kind}.py")).display().to_string(),
                "--params".to_string(),
                "{params}".to_string(),
                "--output".to_string(),
                "{output}".to_string(),
            ],
        };

        registry.register(
            KindDescriptor::new("diamond", command("diamond")).with_schema(ParamSchema::new(vec![
                seeds(),
                FieldSpec::required("n", int_at_least(1)),
                FieldSpec::optional("alpha", int_at_least(1), json!(1)),
                FieldSpec::optional(
                    "network",
                    FieldType::Choice {
                        values: vec!["DEFAULT".into(), "SHARED_DISORDER".into()],
                    },
                    json!("DEFAULT"),
                ),
                FieldSpec::optional(
                    "edges",
                    FieldType::Choice {
                        values: vec!["all".into(), "limited".into()],
                    },
                    json!("all"),
                ),
            ])),
        );

        registry.register(
            KindDescriptor::new("must", command("must"))
                .with_queue(QueueName::heavy())
                .with_schema(ParamSchema::new(vec![
                    seeds(),
                    network(),
                    FieldSpec::required("hubpenalty", unit_interval()),
                    FieldSpec::required("multiple", FieldType::Bool),
                    FieldSpec::required("trees", int_at_least(1)),
                    FieldSpec::required("maxit", int_at_least(1)),
                ])),
        );

        registry.register(
            KindDescriptor::new("kpm", command("kpm")).with_schema(ParamSchema::new(vec![
                seeds(),
                network(),
                FieldSpec::required("k", int_at_least(1)),
            ])),
        );

        registry.register(
            KindDescriptor::new("robust", command("robust"))
                .with_queue(QueueName::heavy())
                .with_schema(ParamSchema::new(vec![
                    seeds(),
                    network(),
                    FieldSpec::optional("initial_fraction", unit_interval(), json!(0.25)),
                    FieldSpec::optional("reduction_factor", unit_interval(), json!(0.9)),
                    FieldSpec::optional("num_trees", int_at_least(1), json!(30)),
                    FieldSpec::optional("threshold", unit_interval(), json!(0.1)),
                ])),
        );

        registry.register(
            KindDescriptor::new("domino", command("domino"))
                .with_schema(ParamSchema::new(vec![seeds(), network()])),
        );

        registry.register(
            KindDescriptor::new("trustrank", command("trustrank")).with_schema(ParamSchema::new(
                vec![
                    seeds(),
                    FieldSpec::optional("damping_factor", unit_interval(), json!(0.85)),
                    FieldSpec::optional("only_direct_drugs", FieldType::Bool, json!(true)),
                    FieldSpec::optional("only_approved_drugs", FieldType::Bool, json!(true)),
                    top_n(),
                ],
            )),
        );

        registry.register(
            KindDescriptor::new("closeness", command("closeness")).with_schema(ParamSchema::new(
                vec![
                    seeds(),
                    FieldSpec::optional("only_direct_drugs", FieldType::Bool, json!(true)),
                    FieldSpec::optional("only_approved_drugs", FieldType::Bool, json!(true)),
                    top_n(),
                ],
            )),
        );

        registry.register(
            KindDescriptor::new("bicon", command("bicon"))
                .with_queue(QueueName::heavy())
                .with_output(OutputFormat::Json)
                .with_schema(ParamSchema::new(vec![
                    // Location of the uploaded expression matrix.
                    FieldSpec::required("expression_file", FieldType::Text),
                    FieldSpec::optional("lg_min", int_at_least(1), json!(10)),
                    FieldSpec::optional("lg_max", int_at_least(1), json!(15)),
                    network(),
                ])),
        );

        registry.register(
            KindDescriptor::new("graph", command("graph"))
                .with_queue(QueueName::heavy())
                .with_output(OutputFormat::Graphml)
                .with_schema(ParamSchema::new(vec![
                    FieldSpec::optional(
                        "nodes",
                        FieldType::StringList,
                        json!(["disorder", "drug", "gene", "protein"]),
                    ),
                    FieldSpec::optional(
                        "edges",
                        FieldType::StringList,
                        json!([
                            "disorder_is_subtype_of_disorder",
                            "drug_has_indication",
                            "drug_has_target",
                            "gene_associated_with_disorder",
                            "protein_encoded_by_gene",
                            "protein_interacts_with_protein"
                        ]),
                    ),
                    FieldSpec::optional(
                        "ppi_evidence",
                        choices(&["exp", "ortho", "pred"]),
                        json!(["exp"]),
                    ),
                    FieldSpec::optional("ppi_self_loops", FieldType::Bool, json!(false)),
                    FieldSpec::optional("taxid", FieldType::Array, json!([9606])),
                    FieldSpec::optional(
                        "drug_groups",
                        choices(&[
                            "approved",
                            "experimental",
                            "illicit",
                            "investigational",
                            "nutraceutical",
                            "vet_approved",
                            "withdrawn",
                        ]),
                        json!(["approved"]),
                    ),
                    FieldSpec::optional("concise", FieldType::Bool, json!(true)),
                    FieldSpec::optional("include_omim", FieldType::Bool, json!(true)),
                    FieldSpec::optional("disgenet_threshold", unit_interval(), json!(0.0)),
                    FieldSpec::optional("use_omim_ids", FieldType::Bool, json!(false)),
                    FieldSpec::optional("split_drug_types", FieldType::Bool, json!(false)),
                    FieldSpec::optional("reviewed_proteins", FieldType::Array, json!([true, false])),
                ])),
        );

        registry.register(
            KindDescriptor::new("validation-drug", command("validation_drug"))
                .with_output(OutputFormat::Json)
                .with_schema(ParamSchema::new(vec![
                    // Ranked `[drug, score]` pairs.
                    FieldSpec::required("test_drugs", FieldType::Array),
                    true_drugs(),
                    permutations(),
                    only_approved(),
                ])),
        );

        registry.register(
            KindDescriptor::new("validation-module", command("validation_module"))
                .with_output(OutputFormat::Json)
                .with_schema(ParamSchema::new(vec![
                    module_members(),
                    module_member_type(),
                    true_drugs(),
                    permutations(),
                    only_approved(),
                ])),
        );

        registry.register(
            KindDescriptor::new("validation-joint", command("validation_joint"))
                .with_output(OutputFormat::Json)
                .with_schema(ParamSchema::new(vec![
                    module_members(),
                    module_member_type(),
                    FieldSpec::required("test_drugs", FieldType::StringList),
                    true_drugs(),
                    permutations(),
                    only_approved(),
                ])),
        );

        registry.register(
            KindDescriptor::new("comorbiditome", command("comorbiditome"))
                .with_queue(QueueName::heavy())
                .with_output(OutputFormat::Graphml)
                .with_schema(ParamSchema::new(vec![
                    unset("max_phi_cor", unbounded_float()),
                    unset("min_phi_cor", unbounded_float()),
                    unset("max_p_value", unit_interval()),
                    unset("min_p_value", unit_interval()),
                    // Induce the subnetwork on these disorders.
                    unset("mondo", FieldType::StringList),
                ])),
        );

        registry
    }
}

impl FromIterator<KindDescriptor> for KindRegistry {
    fn from_iter<I: IntoIterator<Item = KindDescriptor>>(iter: I) -> Self {
        let mut registry = Self::new();
        for descriptor in iter {
            registry.register(descriptor);
        }
        registry
    }
}

fn seeds() -> FieldSpec {
    FieldSpec::required(
        "seeds",
        FieldType::Seeds {
            type_field: Some("seed_type".to_string()),
        },
    )
}

fn network() -> FieldSpec {
    FieldSpec::optional("network", FieldType::Text, json!("DEFAULT"))
}

/// Optional with no default; omitted stays omitted.
fn unset(name: &str, field_type: FieldType) -> FieldSpec {
    FieldSpec {
        name: name.to_string(),
        field_type,
        required: false,
        default: None,
    }
}

// Omitted means "all results".
fn top_n() -> FieldSpec {
    unset("N", int_at_least(1))
}

fn module_members() -> FieldSpec {
    FieldSpec::required("module_members", FieldType::StringList)
}

fn module_member_type() -> FieldSpec {
    FieldSpec::required("module_member_type", choice(&["gene", "protein"]))
}

fn true_drugs() -> FieldSpec {
    FieldSpec::required("true_drugs", FieldType::StringList)
}

fn permutations() -> FieldSpec {
    FieldSpec::required("permutations", int_at_least(1))
}

fn only_approved() -> FieldSpec {
    FieldSpec::required("only_approved_drugs", FieldType::Bool)
}

fn choice(values: &[&str]) -> FieldType {
    FieldType::Choice {
        values: values.iter().map(|v| v.to_string()).collect(),
    }
}

fn choices(values: &[&str]) -> FieldType {
    FieldType::ChoiceList {
        values: values.iter().map(|v| v.to_string()).collect(),
    }
}

fn unbounded_float() -> FieldType {
    FieldType::Float {
        min: None,
        max: None,
    }
}

fn int_at_least(min: i64) -> FieldType {
    FieldType::Integer {
        min: Some(min),
        max: None,
    }
}

fn unit_interval() -> FieldType {
    FieldType::Float {
        min: Some(0.0),
        max: Some(1.0),
    }
}
