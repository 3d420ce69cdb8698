//! Scripted [`SourceClient`] for engine tests. Records every call it serves.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use hackcrawl_crawler::SourceClient;
use hackcrawl_shared::{
    ChildDetail, ChildRecord, ChildSummary, HackCrawlError, OrgInfo, ParentDetail, ParentRecord,
    ParentSummary, Result,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListParents(u32),
    ListChildren(String, u32),
    ParentDetail(String),
    ChildDetail(String),
}

#[derive(Default)]
pub struct ScriptedSource {
    parent_pages: Vec<Vec<ParentSummary>>,
    child_pages: HashMap<String, Vec<Vec<ChildSummary>>>,
    failing_parent_pages: HashSet<u32>,
    failing_children: Mutex<HashSet<String>>,
    /// Remaining transient failures before a child detail succeeds.
    flaky_children: Mutex<HashMap<String, u32>>,
    cancel_on_child: Option<(String, CancellationToken)>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next parent listing page.
    pub fn parent_page(mut self, parents: Vec<ParentSummary>) -> Self {
        self.parent_pages.push(parents);
        self
    }

    pub fn children(mut self, parent: &str, pages: Vec<Vec<ChildSummary>>) -> Self {
        self.child_pages.insert(parent.to_string(), pages);
        self
    }

    pub fn fail_parent_page(mut self, page: u32) -> Self {
        self.failing_parent_pages.insert(page);
        self
    }

    pub fn fail_child(self, external_id: &str) -> Self {
        self.failing_children
            .lock()
            .unwrap()
            .insert(external_id.to_string());
        self
    }

    pub fn flaky_child(self, external_id: &str, failures: u32) -> Self {
        self.flaky_children
            .lock()
            .unwrap()
            .insert(external_id.to_string(), failures);
        self
    }

    /// Cancel `token` while serving the detail of `external_id`.
    pub fn cancel_on_child(mut self, external_id: &str, token: CancellationToken) -> Self {
        self.cancel_on_child = Some((external_id.to_string(), token));
        self
    }

    pub fn heal_child(&self, external_id: &str) {
        self.failing_children.lock().unwrap().remove(external_id);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl SourceClient for ScriptedSource {
    async fn list_parents(&self, page: u32) -> Result<Vec<ParentSummary>> {
        self.record(Call::ListParents(page));
        if self.failing_parent_pages.contains(&page) {
            return Err(HackCrawlError::transient(format!("page {page}: HTTP 502")));
        }
        Ok(self
            .parent_pages
            .get(page as usize)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_children(
        &self,
        parent_external_id: &str,
        page: u32,
    ) -> Result<Vec<ChildSummary>> {
        self.record(Call::ListChildren(parent_external_id.to_string(), page));
        Ok(self
            .child_pages
            .get(parent_external_id)
            .and_then(|pages| pages.get(page as usize))
            .cloned()
            .unwrap_or_default())
    }

    async fn parent_detail(&self, parent: &ParentRecord) -> Result<ParentDetail> {
        self.record(Call::ParentDetail(parent.external_id.clone()));
        Ok(ParentDetail {
            description: format!("About {}  ✨\n\nDetails.", parent.external_id),
            url: format!(
                "https://example.test/acme/hackathons/{}",
                parent.slug.as_deref().unwrap_or_default()
            ),
        })
    }

    async fn child_detail(&self, child: &ChildRecord) -> Result<ChildDetail> {
        let id = child.external_id.clone();
        self.record(Call::ChildDetail(id.clone()));

        if let Some((target, token)) = &self.cancel_on_child {
            if *target == id {
                token.cancel();
            }
        }
        if self.failing_children.lock().unwrap().contains(&id) {
            return Err(HackCrawlError::transient(format!("{id}: HTTP 503")));
        }
        if let Some(remaining) = self.flaky_children.lock().unwrap().get_mut(&id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(HackCrawlError::transient(format!("{id}: connection reset")));
            }
        }

        Ok(ChildDetail {
            title: Some(format!("Project {id} 🚀")),
            description: "A  tool\nfor builders".into(),
            tags: vec!["rust".into(), "AI".into(), "rust".into(), " ".into()],
            url: None,
        })
    }
}

pub fn parent(id: &str, eligible: bool) -> ParentSummary {
    ParentSummary {
        external_id: id.to_string(),
        name: format!("Hackathon {id} 🏆"),
        slug: Some(format!("{id}-slug")),
        org: OrgInfo {
            id: "o1".into(),
            name: "Acme  Labs".into(),
            slug: "acme".into(),
        },
        categories: vec!["DeFi".into(), "AI ".into()],
        eligible,
    }
}

pub fn child(id: &str) -> ChildSummary {
    ChildSummary {
        external_id: id.to_string(),
        title: format!("Project {id}"),
        description: "listed   teaser".into(),
        url: Some(format!("https://example.test/project/{id}")),
    }
}
