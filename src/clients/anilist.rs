use super::{PageRequest, RawRecord, SinceMarker, SourceClient, SourcePage, SourceError, retry_after};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ANILIST_API: &str = "https://graphql.anilist.co";
const PER_PAGE: u32 = 50;
const MAX_PAGES: u32 = 10;

const AIRING_QUERY: &str = r"
    query ($page: Int, $perPage: Int, $from: Int, $to: Int) {
        Page(page: $page, perPage: $perPage) {
            pageInfo { hasNextPage }
            airingSchedules(airingAt_greater: $from, airingAt_lesser: $to, sort: TIME) {
                episode
                airingAt
                media {
                    id
                    title { romaji english native }
                    synonyms
                    format
                    status
                    genres
                    siteUrl
                    externalLinks { site type }
                }
            }
        }
    }
";

#[derive(Serialize)]
struct GraphQLRequest<'a> {
    query: &'a str,
    variables: Variables,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Variables {
    page: u32,
    per_page: u32,
    from: i64,
    to: i64,
}

#[derive(Deserialize)]
struct GraphQLResponse {
    data: Option<Data>,
    #[serde(default)]
    errors: Vec<GraphQLError>,
}

#[derive(Deserialize)]
struct GraphQLError {
    message: String,
}

#[derive(Deserialize)]
struct Data {
    #[serde(rename = "Page")]
    page: Page,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page {
    page_info: PageInfo,
    airing_schedules: Vec<Schedule>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Schedule {
    episode: i32,
    airing_at: i64,
    media: Option<Media>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Media {
    id: i64,
    title: Title,
    #[serde(default)]
    synonyms: Option<Vec<String>>,
    format: Option<String>,
    status: Option<String>,
    #[serde(default)]
    genres: Option<Vec<String>>,
    site_url: Option<String>,
    #[serde(default)]
    external_links: Option<Vec<ExternalLink>>,
}

#[derive(Deserialize)]
struct Title {
    romaji: Option<String>,
    english: Option<String>,
    native: Option<String>,
}

#[derive(Deserialize)]
struct ExternalLink {
    site: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// One scheduled episode from the AniList airing calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnilistAiring {
    pub media_id: i64,
    pub episode: i32,
    /// Unix seconds.
    pub airing_at: i64,
    pub title_romaji: Option<String>,
    pub title_english: Option<String>,
    pub title_native: Option<String>,
    pub synonyms: Vec<String>,
    pub format: Option<String>,
    pub status: Option<String>,
    pub genres: Vec<String>,
    pub site_url: Option<String>,
    /// First streaming service listed for the show.
    pub streaming_site: Option<String>,
}

fn map_schedule(s: Schedule) -> Option<AnilistAiring> {
    let media = s.media?;
    let streaming_site = media
        .external_links
        .unwrap_or_default()
        .into_iter()
        .find(|l| l.kind.as_deref() == Some("STREAMING"))
        .map(|l| l.site);

    Some(AnilistAiring {
        media_id: media.id,
        episode: s.episode,
        airing_at: s.airing_at,
        title_romaji: media.title.romaji,
        title_english: media.title.english,
        title_native: media.title.native,
        synonyms: media.synonyms.unwrap_or_default(),
        format: media.format,
        status: media.status,
        genres: media.genres.unwrap_or_default(),
        site_url: media.site_url,
        streaming_site,
    })
}

/// Parses one page of the airing schedule; returns the rows and whether more pages follow.
fn parse_page(body: &str) -> Result<(Vec<AnilistAiring>, bool), SourceError> {
    let response: GraphQLResponse = serde_json::from_str(body)
        .map_err(|e| SourceError::MalformedResponse(format!("anilist body: {e}")))?;

    let Some(data) = response.data else {
        let message = response
            .errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(SourceError::MalformedResponse(format!(
            "anilist returned no data: {message}"
        )));
    };

    let records = data
        .page
        .airing_schedules
        .into_iter()
        .filter_map(map_schedule)
        .collect();
    Ok((records, data.page.page_info.has_next_page))
}

/// Episodes that aired since the last run, or the last day on a first run,
/// through the lookahead. Anchored on the fetch start so every page shares it.
fn window(request: PageRequest<'_>, lookahead: Duration) -> (i64, i64) {
    let now = request.started_at.timestamp();
    let from = request
        .since
        .and_then(SinceMarker::as_datetime)
        .map_or(now - 86_400, |dt| dt.timestamp())
        .min(now);
    let to = now + i64::try_from(lookahead.as_secs()).unwrap_or(i64::MAX / 2);
    (from, to)
}

/// Serial-video adapter over the public AniList GraphQL airing calendar.
#[derive(Clone)]
pub struct AnilistClient {
    client: Client,
    endpoint: String,
    lookahead: Duration,
}

impl AnilistClient {
    pub fn new(
        endpoint: Option<&str>,
        user_agent: &str,
        timeout: Duration,
        lookahead_days: u32,
    ) -> Self {
        Self {
            client: Client::builder()
                .user_agent(user_agent)
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            endpoint: endpoint.unwrap_or(ANILIST_API).to_string(),
            lookahead: Duration::from_secs(u64::from(lookahead_days) * 86_400),
        }
    }

    async fn request_page(&self, page: u32, from: i64, to: i64) -> Result<String, SourceError> {
        let request_body = GraphQLRequest {
            query: AIRING_QUERY,
            variables: Variables {
                page,
                per_page: PER_PAGE,
                from,
                to,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(
                status,
                retry_after(response.headers()),
            ));
        }

        response
            .text()
            .await
            .map_err(|e| SourceError::from_reqwest(&e))
    }
}

#[async_trait]
impl SourceClient for AnilistClient {
    async fn fetch(&self, since: Option<&SinceMarker>) -> Result<Vec<RawRecord>, SourceError> {
        let started_at = Utc::now();
        let mut records = Vec::new();
        for page in 1..=MAX_PAGES {
            let fetched = self
                .fetch_page(PageRequest {
                    since,
                    page,
                    started_at,
                })
                .await?;
            records.extend(fetched.records);
            if !fetched.has_next {
                break;
            }
        }

        Ok(records)
    }

    async fn fetch_page(&self, request: PageRequest<'_>) -> Result<SourcePage, SourceError> {
        let (from, to) = window(request, self.lookahead);
        let body = self.request_page(request.page, from, to).await?;
        let (airings, has_next) = parse_page(&body)?;

        Ok(SourcePage {
            records: airings.into_iter().map(RawRecord::Anilist).collect(),
            has_next: has_next && request.page < MAX_PAGES,
        })
    }
}
