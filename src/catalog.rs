//! Template catalog
//!
//! The template model the engine schedules over, plus the read-only catalog
//! collaborator trait. Template parsing and on-disk formats live outside
//! this crate; the engine consumes an already-loaded, ordered sequence of
//! templates exactly once before scheduling begins.
//!
//! Templates sharing an identical underlying request are *clustered*: the
//! cluster executes once per target but every member still reports
//! independently.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::targets::Target;

/// Protocol class a template speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolClass {
    Http,
    Dns,
    Tcp,
    Udp,
    Ssl,
}

impl ProtocolClass {
    /// Whether a template of this class is worth dispatching against the
    /// given target form. Raw socket classes need a host[:port] input;
    /// HTTP and DNS templates normalize either form themselves.
    pub fn applies_to(&self, target: &Target) -> bool {
        match self {
            ProtocolClass::Http | ProtocolClass::Dns => true,
            ProtocolClass::Tcp | ProtocolClass::Udp | ProtocolClass::Ssl => !target.is_url(),
        }
    }
}

/// A single protocol request carried by a template.
///
/// Opaque to the engine beyond its clustering signature; the probe executor
/// interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub payload: String,
}

/// An externally-supplied unit of work, identified by a stable id/path.
/// Read-only and reusable across every target in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Stable identifier (template name or path)
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Technology/category tags, matched against fingerprints in
    /// automatic-scan mode
    #[serde(default)]
    pub tags: Vec<String>,
    pub protocol: ProtocolClass,
    pub requests: Vec<ProbeRequest>,
}

impl Template {
    /// Signature identifying templates that can execute as one cluster:
    /// same protocol, identical request list.
    pub fn cluster_key(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.protocol.hash(&mut hasher);
        self.requests.hash(&mut hasher);
        hasher.finish()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// A group of templates merged for execution.
///
/// `representative` carries the requests actually sent; `members` lists
/// every template the result must be reported under.
#[derive(Debug, Clone)]
pub struct TemplateCluster {
    pub representative: Arc<Template>,
    pub members: Vec<Arc<Template>>,
}

impl TemplateCluster {
    fn single(template: Arc<Template>) -> Self {
        Self {
            representative: template.clone(),
            members: vec![template],
        }
    }

    pub fn is_clustered(&self) -> bool {
        self.members.len() > 1
    }
}

/// Merge templates with identical requests into clusters, preserving the
/// first-seen order of the input sequence. With `disable` set, every
/// template becomes its own cluster.
pub fn cluster_templates(templates: &[Arc<Template>], disable: bool) -> Vec<TemplateCluster> {
    if disable {
        return templates
            .iter()
            .map(|t| TemplateCluster::single(t.clone()))
            .collect();
    }

    let mut order: Vec<u64> = Vec::new();
    let mut groups: HashMap<u64, Vec<Arc<Template>>> = HashMap::new();
    for template in templates {
        // Templates with no requests cannot share an execution; key them
        // by id so each stays a singleton cluster.
        let key = if template.requests.is_empty() {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            template.id.hash(&mut hasher);
            hasher.finish() ^ 0x9e37_79b9_7f4a_7c15
        } else {
            template.cluster_key()
        };
        if !groups.contains_key(&key) {
            order.push(key);
        }
        groups.entry(key).or_default().push(template.clone());
    }

    let clusters: Vec<TemplateCluster> = order
        .into_iter()
        .map(|key| {
            let members = groups.remove(&key).unwrap_or_default();
            TemplateCluster {
                representative: members[0].clone(),
                members,
            }
        })
        .collect();

    let merged = templates.len() - clusters.len();
    if merged > 0 {
        debug!(
            templates = templates.len(),
            clusters = clusters.len(),
            "clustered {} duplicate requests",
            merged
        );
    }
    clusters
}

/// Filter criteria handed to the catalog at load time
#[derive(Debug, Clone, Default)]
pub struct TemplateFilter {
    /// Only templates carrying at least one of these tags (empty = all)
    pub tags: Vec<String>,
    /// Templates carrying any of these tags are excluded
    pub exclude_tags: Vec<String>,
    /// Restrict to protocol classes (empty = all)
    pub protocols: Vec<ProtocolClass>,
}

impl TemplateFilter {
    pub fn matches(&self, template: &Template) -> bool {
        if !self.protocols.is_empty() && !self.protocols.contains(&template.protocol) {
            return false;
        }
        if self.exclude_tags.iter().any(|t| template.has_tag(t)) {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| template.has_tag(t)) {
            return false;
        }
        true
    }
}

/// A syntax problem reported by catalog validation
#[derive(Debug, Clone, Serialize)]
pub struct SyntaxIssue {
    pub template: String,
    pub message: String,
}

/// Read-only source of validated templates (external collaborator).
///
/// The engine calls `load` exactly once per run, before scheduling.
pub trait TemplateCatalog: Send + Sync {
    /// Load the filtered, ordered template sequence
    fn load(&self, filter: &TemplateFilter) -> Result<Vec<Arc<Template>>>;

    /// Report syntax problems without loading
    fn validate(&self) -> Vec<SyntaxIssue>;
}

/// Catalog over an in-memory template list. The production loader parses
/// templates from disk elsewhere and hands them over through this same
/// trait; this implementation also backs the test suites.
pub struct StaticCatalog {
    templates: Vec<Arc<Template>>,
}

impl StaticCatalog {
    pub fn new(templates: Vec<Template>) -> Self {
        Self {
            templates: templates.into_iter().map(Arc::new).collect(),
        }
    }
}

impl TemplateCatalog for StaticCatalog {
    fn load(&self, filter: &TemplateFilter) -> Result<Vec<Arc<Template>>> {
        Ok(self
            .templates
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    fn validate(&self) -> Vec<SyntaxIssue> {
        self.templates
            .iter()
            .filter(|t| t.requests.is_empty())
            .map(|t| SyntaxIssue {
                template: t.id.clone(),
                message: "template carries no requests".into(),
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn test_template(id: &str, protocol: ProtocolClass, path: &str) -> Template {
    Template {
        id: id.to_string(),
        name: id.to_string(),
        tags: Vec::new(),
        protocol,
        requests: vec![ProbeRequest {
            method: "GET".into(),
            path: path.into(),
            payload: String::new(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_requests_cluster() {
        let a = Arc::new(test_template("cve-1", ProtocolClass::Http, "/admin"));
        let b = Arc::new(test_template("cve-2", ProtocolClass::Http, "/admin"));
        let c = Arc::new(test_template("cve-3", ProtocolClass::Http, "/login"));

        let clusters = cluster_templates(&[a, b, c], false);
        assert_eq!(clusters.len(), 2);
        assert!(clusters[0].is_clustered());
        assert_eq!(clusters[0].members.len(), 2);
        assert_eq!(clusters[1].members.len(), 1);
    }

    #[test]
    fn test_clustering_disabled() {
        let a = Arc::new(test_template("cve-1", ProtocolClass::Http, "/admin"));
        let b = Arc::new(test_template("cve-2", ProtocolClass::Http, "/admin"));
        let clusters = cluster_templates(&[a, b], true);
        assert_eq!(clusters.len(), 2);
        assert!(!clusters[0].is_clustered());
    }

    #[test]
    fn test_protocol_mismatch_never_clusters() {
        let a = Arc::new(test_template("t1", ProtocolClass::Http, "/x"));
        let b = Arc::new(test_template("t2", ProtocolClass::Tcp, "/x"));
        let clusters = cluster_templates(&[a, b], false);
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn test_filter_tags() {
        let mut wordpress = test_template("wp-1", ProtocolClass::Http, "/wp-login.php");
        wordpress.tags = vec!["wordpress".into(), "cms".into()];
        let plain = test_template("misc-1", ProtocolClass::Http, "/");

        let filter = TemplateFilter {
            tags: vec!["wordpress".into()],
            ..Default::default()
        };
        assert!(filter.matches(&wordpress));
        assert!(!filter.matches(&plain));

        let exclude = TemplateFilter {
            exclude_tags: vec!["cms".into()],
            ..Default::default()
        };
        assert!(!exclude.matches(&wordpress));
        assert!(exclude.matches(&plain));
    }

    #[test]
    fn test_protocol_applicability() {
        let url = Target::new("https://example.com");
        let hostport = Target::new("example.com:25");
        assert!(ProtocolClass::Http.applies_to(&url));
        assert!(ProtocolClass::Http.applies_to(&hostport));
        assert!(!ProtocolClass::Tcp.applies_to(&url));
        assert!(ProtocolClass::Tcp.applies_to(&hostport));
    }

    #[test]
    fn test_static_catalog_load_and_validate() {
        let mut empty = test_template("broken", ProtocolClass::Http, "/");
        empty.requests.clear();
        let catalog = StaticCatalog::new(vec![
            test_template("ok", ProtocolClass::Http, "/"),
            empty,
        ]);
        let issues = catalog.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].template, "broken");

        let loaded = catalog.load(&TemplateFilter::default()).unwrap();
        assert_eq!(loaded.len(), 2);
    }
}
