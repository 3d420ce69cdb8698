//! Production [`SourceClient`]: GraphQL listings plus scraped HTML detail pages.

use std::sync::LazyLock;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{COOKIE, ORIGIN, REFERER};
use scraper::{ElementRef, Html, Selector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};
use url::Url;

use hackcrawl_shared::{
    ChildDetail, ChildRecord, ChildSummary, HackCrawlError, OrgInfo, ParentDetail, ParentRecord,
    ParentSummary, Result, SourceConfig, validate_source,
};

use crate::source::SourceClient;

const CHALLENGES_QUERY: &str = r#"
query ALL_CHALLENGES_QUERY($sortBy: ChallengeOrderByWithRelationInput, $page: Int) {
  challenges(
    where: { publishInfo: { state: { equals: ACTIVE } } },
    page: $page,
    orderBy: $sortBy
  ) {
    id
    name
    slug
    isClosed
    organization { id name slug }
    industries { title }
  }
}
"#;

const PROJECTS_QUERY: &str = r#"
query PROJECTS_BY_CHALLENGE($orderBy: ProjectOrderByWithRelationInput!, $whereInput: ProjectWhereInput, $page: Int) {
  projects(orderBy: $orderBy, where: $whereInput, page: $page) {
    id
    name
    teaser
    description
  }
}
"#;

static EDITOR_BODY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".html-editor-body").expect("valid selector"));
static HEADING: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1").expect("valid selector"));
static TAG_ITEMS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("ul.tags span").expect("valid selector"));

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphqlRequest<'a> {
    operation_name: &'a str,
    variables: serde_json::Value,
    query: &'a str,
}

#[derive(Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Deserialize)]
struct ChallengesData {
    #[serde(default)]
    challenges: Vec<ChallengeNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeNode {
    id: Option<String>,
    name: Option<String>,
    slug: Option<String>,
    #[serde(default)]
    is_closed: bool,
    organization: Option<OrganizationNode>,
    #[serde(default)]
    industries: Vec<IndustryNode>,
}

#[derive(Deserialize)]
struct OrganizationNode {
    id: Option<String>,
    name: Option<String>,
    slug: Option<String>,
}

#[derive(Deserialize)]
struct IndustryNode {
    title: Option<String>,
}

#[derive(Deserialize)]
struct ProjectsData {
    #[serde(default)]
    projects: Vec<ProjectNode>,
}

#[derive(Deserialize)]
struct ProjectNode {
    id: Option<String>,
    name: Option<String>,
    teaser: Option<String>,
    description: Option<String>,
}

// ---------------------------------------------------------------------------
// GraphqlSource
// ---------------------------------------------------------------------------

/// HTTP client for the hackathon platform.
pub struct GraphqlSource {
    client: Client,
    api_url: Url,
    /// Always ends with `/` so relative joins append.
    site_url: Url,
    cookie: Option<String>,
}

impl GraphqlSource {
    /// Build a client from the `[source]` config and an optional session cookie.
    pub fn new(config: &SourceConfig, cookie: Option<String>) -> Result<Self> {
        validate_source(config)?;

        let api_url = Url::parse(&config.api_url)
            .map_err(|e| HackCrawlError::config(format!("source.api_url: {e}")))?;
        let site_url = Url::parse(&format!("{}/", config.site_url.trim_end_matches('/')))
            .map_err(|e| HackCrawlError::config(format!("source.site_url: {e}")))?;

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| HackCrawlError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url,
            site_url,
            cookie,
        })
    }

    fn origin(&self) -> String {
        self.site_url.as_str().trim_end_matches('/').to_string()
    }

    async fn post_query<T: DeserializeOwned + Send>(
        &self,
        request: &GraphqlRequest<'_>,
    ) -> Result<T> {
        let mut builder = self
            .client
            .post(self.api_url.clone())
            .header(ORIGIN, self.origin())
            .header(REFERER, self.site_url.as_str())
            .json(request);
        if let Some(cookie) = &self.cookie {
            builder = builder.header(COOKIE, cookie);
        }

        let response = builder.send().await.map_err(|e| {
            HackCrawlError::transient(format!("{} {}: {e}", request.operation_name, self.api_url))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(HackCrawlError::transient(format!(
                "{} {}: HTTP {status}",
                request.operation_name, self.api_url
            )));
        }

        let body = response.text().await.map_err(|e| {
            HackCrawlError::transient(format!("{}: body read failed: {e}", request.operation_name))
        })?;

        let parsed: GraphqlResponse<T> = serde_json::from_str(&body).map_err(|e| {
            HackCrawlError::malformed(format!("{}: {e}", request.operation_name))
        })?;

        match parsed.data {
            Some(data) => Ok(data),
            None => {
                let messages: Vec<String> = parsed.errors.into_iter().map(|e| e.message).collect();
                Err(HackCrawlError::malformed(format!(
                    "{}: no data ({})",
                    request.operation_name,
                    messages.join("; ")
                )))
            }
        }
    }

    async fn get_html(&self, url: &Url) -> Result<String> {
        debug!(%url, "fetching detail page");

        let mut builder = self.client.get(url.clone());
        if let Some(cookie) = &self.cookie {
            builder = builder.header(COOKIE, cookie);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| HackCrawlError::transient(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HackCrawlError::transient(format!("{url}: HTTP {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| HackCrawlError::transient(format!("{url}: body read failed: {e}")))
    }

    fn site_join(&self, path: &str) -> Result<Url> {
        self.site_url
            .join(path)
            .map_err(|e| HackCrawlError::malformed(format!("invalid detail path '{path}': {e}")))
    }

    /// Public page of a child, used when the listing carries no URL.
    fn child_url(&self, external_id: &str) -> Result<Url> {
        self.site_join(&format!("project/{external_id}"))
    }
}

#[async_trait]
impl SourceClient for GraphqlSource {
    #[instrument(skip(self))]
    async fn list_parents(&self, page: u32) -> Result<Vec<ParentSummary>> {
        let request = GraphqlRequest {
            operation_name: "ALL_CHALLENGES_QUERY",
            variables: json!({ "sortBy": { "order": "desc" }, "page": page }),
            query: CHALLENGES_QUERY,
        };
        let data: ChallengesData = self.post_query(&request).await?;
        debug!(count = data.challenges.len(), "listed parents");
        Ok(data.challenges.into_iter().map(parent_summary).collect())
    }

    #[instrument(skip(self))]
    async fn list_children(
        &self,
        parent_external_id: &str,
        page: u32,
    ) -> Result<Vec<ChildSummary>> {
        let request = GraphqlRequest {
            operation_name: "PROJECTS_BY_CHALLENGE",
            variables: json!({
                "orderBy": { "name": "asc" },
                "page": page,
                "whereInput": {
                    "state": { "in": ["ACTIVE", "DRAFT", "NOT_ELIGIBLE"] },
                    "challenge": { "id": { "equals": parent_external_id } },
                },
            }),
            query: PROJECTS_QUERY,
        };
        let data: ProjectsData = self.post_query(&request).await?;

        data.projects
            .into_iter()
            .map(|node| -> Result<ChildSummary> {
                let external_id = node.id.unwrap_or_default();
                let url = if external_id.is_empty() {
                    None
                } else {
                    Some(self.child_url(&external_id)?.to_string())
                };
                Ok(ChildSummary {
                    external_id,
                    title: node.name.unwrap_or_default(),
                    description: node.description.or(node.teaser).unwrap_or_default(),
                    url,
                })
            })
            .collect()
    }

    async fn parent_detail(&self, parent: &ParentRecord) -> Result<ParentDetail> {
        let slug = parent.slug.as_deref().filter(|s| !s.is_empty()).ok_or_else(|| {
            HackCrawlError::malformed(format!("parent {} has no slug", parent.external_id))
        })?;
        if parent.org_slug.is_empty() {
            return Err(HackCrawlError::malformed(format!(
                "parent {} has no organization slug",
                parent.external_id
            )));
        }

        let url = self.site_join(&format!("{}/hackathons/{slug}", parent.org_slug))?;
        let body = self.get_html(&url).await?;

        Ok(ParentDetail {
            description: extract_parent_description(&body),
            url: url.to_string(),
        })
    }

    async fn child_detail(&self, child: &ChildRecord) -> Result<ChildDetail> {
        let url = if child.url.is_empty() {
            self.child_url(&child.external_id)?
        } else {
            Url::parse(&child.url).map_err(|e| {
                HackCrawlError::malformed(format!("child {} url '{}': {e}", child.external_id, child.url))
            })?
        };
        let body = self.get_html(&url).await?;

        let mut detail = extract_child_detail(&body);
        detail.url = Some(url.to_string());
        Ok(detail)
    }
}

// ---------------------------------------------------------------------------
// Mapping & extraction
// ---------------------------------------------------------------------------

fn parent_summary(node: ChallengeNode) -> ParentSummary {
    let org = node
        .organization
        .map(|o| OrgInfo {
            id: o.id.unwrap_or_default(),
            name: o.name.unwrap_or_default(),
            slug: o.slug.unwrap_or_default(),
        })
        .unwrap_or_default();

    ParentSummary {
        external_id: node.id.unwrap_or_default(),
        name: node.name.unwrap_or_default(),
        slug: node.slug.filter(|s| !s.is_empty()),
        org,
        categories: node.industries.into_iter().filter_map(|i| i.title).collect(),
        eligible: node.is_closed,
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ")
}

/// Text of the first rich-text block, or empty.
fn extract_parent_description(html: &str) -> String {
    let doc = Html::parse_document(html);
    doc.select(&EDITOR_BODY).next().map(element_text).unwrap_or_default()
}

fn extract_child_detail(html: &str) -> ChildDetail {
    let doc = Html::parse_document(html);

    let title = doc
        .select(&HEADING)
        .next()
        .map(element_text)
        .filter(|t| !t.trim().is_empty());
    let description = doc.select(&EDITOR_BODY).next().map(element_text).unwrap_or_default();
    let tags = doc
        .select(&TAG_ITEMS)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    ChildDetail {
        title,
        description,
        tags,
        url: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hackcrawl_shared::RecordId;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source_for(server: &MockServer, cookie: Option<&str>) -> GraphqlSource {
        let config = SourceConfig {
            api_url: format!("{}/api/graphql", server.uri()),
            site_url: server.uri(),
            ..SourceConfig::default()
        };
        GraphqlSource::new(&config, cookie.map(String::from)).expect("build source")
    }

    #[tokio::test]
    async fn list_parents_maps_challenges() {
        let server = MockServer::start().await;
        let body = json!({
            "data": {
                "challenges": [
                    {
                        "id": "h1",
                        "name": "ETH Lisbon 🚀",
                        "slug": "eth-lisbon",
                        "isClosed": true,
                        "organization": { "id": "o1", "name": "Acme", "slug": "acme" },
                        "industries": [{ "title": "DeFi" }, { "title": "AI" }]
                    },
                    { "id": "h2", "name": "Still open", "slug": "open", "isClosed": false }
                ]
            }
        });

        Mock::given(method("POST"))
            .and(path("/api/graphql"))
            .and(header("cookie", "session=abc"))
            .and(body_partial_json(json!({
                "operationName": "ALL_CHALLENGES_QUERY",
                "variables": { "page": 2 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(&server)
            .await;

        let source = source_for(&server, Some("session=abc"));
        let parents = source.list_parents(2).await.expect("list parents");

        assert_eq!(parents.len(), 2);
        assert_eq!(parents[0].external_id, "h1");
        assert_eq!(parents[0].name, "ETH Lisbon 🚀");
        assert_eq!(parents[0].slug.as_deref(), Some("eth-lisbon"));
        assert_eq!(parents[0].org.slug, "acme");
        assert_eq!(parents[0].categories, vec!["DeFi", "AI"]);
        assert!(parents[0].eligible);
        assert!(!parents[1].eligible);
        assert!(parents[1].org.id.is_empty());
    }

    #[tokio::test]
    async fn empty_page_is_empty_vec() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "data": { "challenges": [] } })),
            )
            .mount(&server)
            .await;

        let parents = source_for(&server, None).list_parents(7).await.unwrap();
        assert!(parents.is_empty());
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = source_for(&server, None).list_parents(0).await.unwrap_err();
        assert!(err.is_retryable(), "got {err}");
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn undecodable_payload_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let err = source_for(&server, None).list_parents(0).await.unwrap_err();
        assert!(matches!(err, HackCrawlError::Malformed { .. }), "got {err}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn graphql_errors_without_data_are_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [{ "message": "Not authorised" }]
            })))
            .mount(&server)
            .await;

        let err = source_for(&server, None).list_parents(0).await.unwrap_err();
        assert!(err.to_string().contains("Not authorised"));
    }

    #[tokio::test]
    async fn list_children_filters_by_parent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "operationName": "PROJECTS_BY_CHALLENGE",
                "variables": { "whereInput": { "challenge": { "id": { "equals": "h1" } } } }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "projects": [
                        { "id": "p1", "name": "Alpha", "teaser": "short", "description": "long" },
                        { "id": "p2", "name": "Beta", "teaser": "only teaser", "description": null },
                        { "name": "No id" }
                    ]
                }
            })))
            .mount(&server)
            .await;

        let source = source_for(&server, None);
        let children = source.list_children("h1", 0).await.unwrap();

        assert_eq!(children.len(), 3);
        assert_eq!(children[0].description, "long");
        assert_eq!(children[1].description, "only teaser");
        assert_eq!(
            children[0].url.as_deref(),
            Some(format!("{}/project/p1", server.uri()).as_str())
        );
        assert!(children[2].external_id.is_empty());
        assert!(children[2].url.is_none());
    }

    #[tokio::test]
    async fn parent_detail_reads_editor_body() {
        let server = MockServer::start().await;
        let page = r#"<html><body>
            <nav>Menu</nav>
            <div class="html-editor-body"><p>Build the future</p><p>of finance.</p></div>
        </body></html>"#;
        Mock::given(method("GET"))
            .and(path("/acme/hackathons/eth-lisbon"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&server)
            .await;

        let mut parent = ParentRecord::new("h1");
        parent.slug = Some("eth-lisbon".into());
        parent.org_slug = "acme".into();

        let detail = source_for(&server, None).parent_detail(&parent).await.unwrap();
        assert!(detail.description.contains("Build the future"));
        assert!(detail.description.contains("of finance."));
        assert!(!detail.description.contains("Menu"));
        assert_eq!(
            detail.url,
            format!("{}/acme/hackathons/eth-lisbon", server.uri())
        );
    }

    #[tokio::test]
    async fn parent_without_slug_is_malformed() {
        let server = MockServer::start().await;
        let parent = ParentRecord::new("h1");
        let err = source_for(&server, None).parent_detail(&parent).await.unwrap_err();
        assert!(matches!(err, HackCrawlError::Malformed { .. }));
    }

    #[tokio::test]
    async fn child_detail_extracts_title_body_and_tags() {
        let server = MockServer::start().await;
        let page = r#"<html><body>
            <h1>Alpha Wallet</h1>
            <div class="html-editor-body">A wallet   for everyone</div>
            <ul class="tags"><li><span>rust</span></li><li><span>DeFi</span></li></ul>
            <ul class="tags"><li><span>rust</span></li></ul>
        </body></html>"#;
        Mock::given(method("GET"))
            .and(path("/project/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&server)
            .await;

        let child = ChildRecord::new("p1", RecordId::new());
        let detail = source_for(&server, None).child_detail(&child).await.unwrap();

        assert_eq!(detail.title.as_deref(), Some("Alpha Wallet"));
        assert_eq!(detail.description, "A wallet   for everyone");
        assert_eq!(detail.tags, vec!["rust", "DeFi", "rust"]);
        assert_eq!(
            detail.url.as_deref(),
            Some(format!("{}/project/p1", server.uri()).as_str())
        );
    }

    #[tokio::test]
    async fn child_detail_not_found_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let child = ChildRecord::new("gone", RecordId::new());
        let err = source_for(&server, None).child_detail(&child).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn missing_heading_yields_no_title() {
        let detail = extract_child_detail("<html><body><p>bare</p></body></html>");
        assert!(detail.title.is_none());
        assert!(detail.description.is_empty());
        assert!(detail.tags.is_empty());
    }
}
