use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::dedup::fingerprint::RequestDescriptor;

pub type CachePredicate = Arc<dyn Fn(&RequestDescriptor) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct CacheRule {
    pub name: String,
    pub methods: Vec<String>,
    pub path_prefix: String,
    pub ttl: Duration,
    predicate: Option<CachePredicate>,
}

impl CacheRule {
    pub fn new(name: impl Into<String>, path_prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            methods: vec!["GET".to_string()],
            path_prefix: path_prefix.into(),
            ttl,
            predicate: None,
        }
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods =
            methods.into_iter().map(|method| method.into().to_ascii_uppercase()).collect();
        self
    }

    /// Adds a request-level condition on top of the method and prefix match.
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&RequestDescriptor) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, request: &RequestDescriptor) -> bool {
        let method = request.method.to_ascii_uppercase();
        self.methods.iter().any(|allowed| *allowed == method)
            && request.path.starts_with(&self.path_prefix)
            && self.predicate.as_ref().map(|predicate| predicate(request)).unwrap_or(true)
    }
}

impl std::fmt::Debug for CacheRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRule")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .field("path_prefix", &self.path_prefix)
            .field("ttl", &self.ttl)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Decides which requests are cacheable and for how long. First matching rule wins.
/// With no rules, reads (`GET`/`HEAD`) are cached with the default TTL.
#[derive(Clone, Debug)]
pub struct CachePolicy {
    rules: Vec<CacheRule>,
    default_ttl: Duration,
}

impl CachePolicy {
    pub fn new(default_ttl: Duration) -> Self {
        Self { rules: Vec::new(), default_ttl }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let default_ttl = config.default_ttl();
        let rules = config
            .routes
            .iter()
            .map(|route| {
                CacheRule::new(
                    route.name.clone(),
                    route.path_prefix.clone(),
                    route.ttl_ms.map(Duration::from_millis).unwrap_or(default_ttl),
                )
                .with_methods(route.methods.iter().cloned())
            })
            .collect();
        Self { rules, default_ttl }
    }

    pub fn with_rule(mut self, rule: CacheRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[CacheRule] {
        &self.rules
    }

    pub fn ttl_for(&self, request: &RequestDescriptor) -> Option<Duration> {
        if self.rules.is_empty() {
            return request.is_read().then_some(self.default_ttl);
        }
        self.rules.iter().find(|rule| rule.matches(request)).map(|rule| rule.ttl)
    }
}
