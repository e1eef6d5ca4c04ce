//! Checks that a candidate DOI really belongs to the publication at hand.

use crate::error::CoreError;
use crate::fetcher::ContentFetcher;
use crate::http::{HttpError, HttpRequest, HttpResponse, PoliteClient, SEARCH_BOT_USER_AGENT};
use crate::resilience::retry::with_captcha_backoff;
use crate::resilience::{BlockDetector, CaptchaBackoff, Gated};

use super::registry::DoiRegistry;
use super::urls::urls_equal;
use super::{doi_link, doi_tail};

/// Registry and redirect checks for DOI candidates.
#[derive(Clone)]
pub struct DoiVerifier {
    client: PoliteClient,
    registry: DoiRegistry,
    captcha: CaptchaBackoff,
}

impl DoiVerifier {
    pub fn new(client: PoliteClient, registry: DoiRegistry) -> Self {
        Self {
            client,
            registry,
            captcha: CaptchaBackoff::default(),
        }
    }

    pub fn with_captcha_backoff(mut self, captcha: CaptchaBackoff) -> Self {
        self.captcha = captcha;
        self
    }

    pub fn registry(&self) -> &DoiRegistry {
        &self.registry
    }

    /// Accept when the handle registry points at `expected_url`, or when the
    /// registered URL embeds the DOI's tail (publisher redesigns keep the
    /// article slug but add path segments).
    pub async fn via_api(&self, doi: &str, expected_url: &str) -> Result<bool, CoreError> {
        if doi.is_empty() || expected_url.is_empty() {
            return Ok(false);
        }
        let Some(link) = self.registry.resolved_link(doi).await? else {
            tracing::debug!(doi = %doi, "DOI not registered");
            return Ok(false);
        };
        if urls_equal(&link, expected_url) {
            return Ok(true);
        }

        let link_lower = link.to_lowercase();
        let tail = doi_tail(doi).to_lowercase();
        if link_lower.contains(&tail) {
            tracing::debug!(doi = %doi, link = %link, "DOI tail found in registered URL");
            return Ok(true);
        }

        tracing::debug!(doi = %doi, link = %link, expected = %expected_url, "registered URL does not match");
        Ok(false)
    }

    /// Follow `https://doi.org/<doi>` as a search-engine bot. Accept when it
    /// lands on `expected_url` or the landing page mentions `surname`.
    ///
    /// CAPTCHA walls are retried with hour-scale backoff; a wall that never
    /// lifts is a negative result, not an error.
    pub async fn via_redirect(
        &self,
        doi: &str,
        expected_url: &str,
        surname: &str,
    ) -> Result<bool, CoreError> {
        if doi.is_empty() {
            return Ok(false);
        }
        let request = HttpRequest::get(doi_link(doi)).user_agent(SEARCH_BOT_USER_AGENT);
        let detector = BlockDetector::captcha_widgets();

        let landed = with_captcha_backoff(self.captcha, |attempt| {
            let request = &request;
            let detector = &detector;
            async move {
                match self.client.send_via_proxies(request, detector).await {
                    Ok(resp) => Ok(Gated::Ready(Some(resp))),
                    Err(HttpError::Blocked { .. }) => {
                        tracing::warn!(doi = %doi, attempt, "captcha on DOI redirect");
                        Ok(Gated::Captcha)
                    }
                    Err(HttpError::Status { status, .. }) => {
                        tracing::debug!(doi = %doi, status, "DOI redirect failed");
                        Ok(Gated::Ready(None))
                    }
                    Err(e) => Err(CoreError::from(e)),
                }
            }
        })
        .await?;

        let Some(Some(resp)) = landed else {
            return Ok(false);
        };
        Ok(redirect_matches(doi, &resp, expected_url, surname))
    }
}

fn redirect_matches(doi: &str, resp: &HttpResponse, expected_url: &str, surname: &str) -> bool {
    if !resp.is_success() {
        return false;
    }
    if urls_equal(&resp.final_url, expected_url) {
        return true;
    }
    if !surname.is_empty() && resp.text().contains(surname) {
        tracing::info!(doi = %doi, surname = %surname, expected = %expected_url, "surname found on DOI landing page");
        return true;
    }
    false
}

/// Whether `surname` occurs in the page the DOI is registered to.
pub async fn author_on_landing_page(
    registry: &DoiRegistry,
    fetcher: &dyn ContentFetcher,
    doi: &str,
    surname: &str,
) -> Result<bool, CoreError> {
    if surname.is_empty() {
        return Ok(false);
    }
    let Some(link) = registry.resolved_link(doi).await? else {
        return Ok(false);
    };
    let page = fetcher.fetch(&link).await?;
    Ok(page.body.contains(surname))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::{MockReply, MockTransport};
    use crate::resilience::{RateLimiter, ThrottlePolicy};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    const ARTICLE: &str = "https://journals.biologists.com/jeb/article/225/22/jeb243973/283144";

    fn verifier(mock: Arc<MockTransport>) -> DoiVerifier {
        let client = PoliteClient::new(mock, Arc::new(RateLimiter::new(ThrottlePolicy::default())));
        DoiVerifier::new(client.clone(), DoiRegistry::new(client))
    }

    fn handle(url: &str) -> MockReply {
        MockReply::json(json!({
            "responseCode": 1,
            "values": [{"type": "URL", "data": {"value": url}}]
        }))
    }

    // ── via_api ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn api_accepts_equal_url() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            "https://doi.org/api/handles/10.1111/gcb.12455",
            handle("http://onlinelibrary.wiley.com/doi/10.1111/gcb.12455/"),
        );
        let v = verifier(mock);
        assert!(
            v.via_api("10.1111/gcb.12455", "https://onlinelibrary.wiley.com/doi/abs/10.1111/gcb.12455")
                .await
                .unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn api_accepts_doi_tail_in_registered_url() {
        let mock = Arc::new(MockTransport::new());
        mock.on("https://doi.org/api/handles/10.1242/jeb.243973", handle(ARTICLE));
        let v = verifier(mock);
        assert!(
            v.via_api("10.1242/jeb.243973", "https://journals.biologists.com/jeb/article-pdf/x.pdf")
                .await
                .unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn api_rejects_unrelated_url() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            "https://doi.org/api/handles/10.1000/aaa",
            handle("https://elsewhere.example/paper/1"),
        );
        let v = verifier(mock);
        assert!(!v.via_api("10.1000/aaa", ARTICLE).await.unwrap());
        assert!(!v.via_api("10.1000/unregistered", ARTICLE).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn api_ignores_partial_suffix_matches() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            "https://doi.org/api/handles/10.1000/suppl.2021",
            handle("https://elsewhere.example/archive/2021/issue7"),
        );
        let v = verifier(mock);
        assert!(
            !v.via_api("10.1000/suppl.2021", "https://pubs.example.org/content/42")
                .await
                .unwrap()
        );
    }

    // ── via_redirect ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn redirect_accepts_landing_url_and_uses_bot_agent() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            "https://doi.org/10.1242/jeb.243973",
            MockReply::html("<html>article</html>").landed_at(ARTICLE),
        );
        let v = verifier(mock.clone());
        assert!(v.via_redirect("10.1242/jeb.243973", ARTICLE, "Rummer").await.unwrap());
        let req = &mock.requests()[0];
        assert_eq!(req.header("user-agent"), Some(SEARCH_BOT_USER_AGENT));
    }

    #[tokio::test(start_paused = true)]
    async fn redirect_accepts_surname_in_body() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            "https://doi.org/10.1000/bbb",
            MockReply::html("<p>J. L. Rummer, P. Munday</p>").landed_at("https://other.example/x"),
        );
        let v = verifier(mock);
        assert!(v.via_redirect("10.1000/bbb", ARTICLE, "Rummer").await.unwrap());
        assert!(!v.via_redirect("10.1000/bbb", ARTICLE, "Bergseth").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn redirect_backs_off_on_captcha_then_succeeds() {
        let mock = Arc::new(MockTransport::new());
        mock.on_sequence(
            "https://doi.org/10.1000/bbb",
            vec![
                MockReply::html("<div class=\"g-recaptcha\"></div>"),
                MockReply::html("<div class=\"g-recaptcha\"></div>"),
                MockReply::html("Rummer").landed_at(ARTICLE),
            ],
        );
        let v = verifier(mock.clone());
        let start = Instant::now();
        assert!(v.via_redirect("10.1000/bbb", ARTICLE, "").await.unwrap());
        assert!(start.elapsed() >= Duration::from_secs(3 * 3600));
        assert_eq!(mock.calls_to("https://doi.org/10.1000/bbb"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn redirect_gives_up_after_persistent_captcha() {
        let mock = Arc::new(MockTransport::new());
        mock.on("https://doi.org/10.1000/bbb", MockReply::html("<form id=\"captcha-form\"></form>"));
        let v = verifier(mock.clone());
        assert!(!v.via_redirect("10.1000/bbb", ARTICLE, "Rummer").await.unwrap());
        assert_eq!(mock.calls_to("https://doi.org/10.1000/bbb"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn redirect_not_found_is_negative() {
        let mock = Arc::new(MockTransport::new());
        let v = verifier(mock);
        assert!(!v.via_redirect("10.1000/missing", ARTICLE, "Rummer").await.unwrap());
    }
}
