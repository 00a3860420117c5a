use core::time::Duration;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use fantoccini::{Client as Driver, Locator, error::CmdError, key::Key};
use pbscr::util::{format_mdy, parse_timestamp_millis};
use regex::Regex;
use scraper::{Html, Selector};
use tokio::{process::Child, time::sleep};
use url::Url;

pub const BASE_URL: &str = "http://abyssc.proboards.com/";
pub const COLUMNS: [&str; 4] = ["timestamp", "thread_name", "thread_id", "text"];

const TYPEAHEAD_TIMEOUT: Duration = Duration::from_secs(10);
const TYPEAHEAD_SETTLE: Duration = Duration::from_secs(2);
const PAGE_DELAY: Duration = Duration::from_millis(1750);
const RETRY_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("couldn't log in: {0}")]
    Authentication(String),
    #[error("couldn't find user {0}")]
    MemberNotFound(CompactString),
}

#[derive(Debug, PartialEq, Eq)]
pub struct Post {
    pub timestamp: DateTime<Utc>,
    pub thread_name: String,
    pub thread_id: i64,
    pub text: String,
}

struct Selectors {
    reg_digits: Regex,
    article: Selector,
    timestamp: Selector,
    link: Selector,
    message: Selector,
    page_li: Selector,
}

impl Selectors {
    fn new() -> Self {
        Self {
            reg_digits: Regex::new(r"\d+").unwrap(),
            article: Selector::parse("article").unwrap(),
            timestamp: Selector::parse(".o-timestamp").unwrap(),
            link: Selector::parse("a").unwrap(),
            message: Selector::parse(".message").unwrap(),
            page_li: Selector::parse(".ui-pagination li").unwrap(),
        }
    }

    /// Every post on a results page, in document order. Articles missing any
    /// of the four fields are skipped.
    fn posts(&self, document: &Html) -> Vec<Post> {
        document
            .select(&self.article)
            .filter_map(|entry| {
                let stamp = entry.select(&self.timestamp).next()?.attr("data-timestamp")?;
                let timestamp = parse_timestamp_millis(stamp)?;

                let link = entry.select(&self.link).next()?;
                let thread_name = link.text().map(str::trim).collect();
                let thread_id = self
                    .reg_digits
                    .find(link.attr("href")?)?
                    .as_str()
                    .parse()
                    .ok()?;

                let text = entry.select(&self.message).next()?.inner_html();

                Some(Post {
                    timestamp,
                    thread_name,
                    thread_id,
                    text,
                })
            })
            .collect()
    }

    /// The last pagination item is the "next page" control; `state-disabled`
    /// on it means this query has run out of pages.
    fn next_disabled(&self, document: &Html) -> bool {
        document
            .select(&self.page_li)
            .last()
            .and_then(|li| li.attr("class"))
            .is_some_and(|class| class.contains("state-disabled"))
    }
}

fn reached_end(cursor: DateTime<Utc>, join_date: DateTime<Utc>) -> bool {
    cursor.date_naive() <= join_date.date_naive()
}

/// Rewrite a results URL to search the window [start, end] again from page 1.
fn with_search_window(mut url: Url, start: DateTime<Utc>, end: DateTime<Utc>) -> Url {
    let keep: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !matches!(&**k, "when_between_start" | "when_between_end" | "page"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(keep)
        .append_pair("when_between_start", &format_mdy(start))
        .append_pair("when_between_end", &format_mdy(end))
        .append_pair("page", "1")
        .finish();

    url
}

fn is_transient(e: &anyhow::Error) -> bool {
    e.downcast_ref::<CmdError>().is_some()
}

pub struct Session {
    driver: Driver,
    process: Child,
    username: String,
    password: String,
    members: Vec<CompactString>,
    join_date: Option<DateTime<Utc>>,
    cursor: DateTime<Utc>,
    last_url: Option<Url>,
    done: bool,
    sel: Selectors,
}

impl Session {
    pub fn new(
        driver: Driver,
        process: Child,
        username: String,
        password: String,
        members: Vec<CompactString>,
    ) -> Self {
        Self {
            driver,
            process,
            username,
            password,
            members,
            join_date: None,
            cursor: Utc::now(),
            last_url: None,
            done: false,
            sel: Selectors::new(),
        }
    }

    /// Log in with the supplied credentials. The search form serves a CAPTCHA
    /// to anonymous visitors, so this has to happen first.
    pub async fn authenticate(&mut self) -> anyhow::Result<()> {
        self.driver.goto(BASE_URL).await?;

        self.driver
            .find(Locator::XPath(r#"//*[@id="login_area"]/a[2]"#))
            .await?
            .click()
            .await?;

        self.driver
            .find(Locator::Css(r#"[name="email"]"#))
            .await?
            .send_keys(&self.username)
            .await?;
        self.driver
            .find(Locator::Css(r#"[name="password"]"#))
            .await?
            .send_keys(&self.password)
            .await?;
        self.driver
            .find(Locator::Css(r#"[name="continue"]"#))
            .await?
            .click()
            .await?;

        let url = self.driver.current_url().await?;
        if url.as_str() == "https://login.proboards.com/forum_submit/login" {
            let error = self.driver.find(Locator::Css(".errors")).await?.text().await?;
            let error = if error.is_empty() {
                "Unspecified problem".to_owned()
            } else {
                error
            };
            return Err(SessionError::Authentication(error).into());
        }

        Ok(())
    }

    /// Fill out the search form: one type-ahead filter entry per member, then
    /// a date range from the earliest join date across all of them to now.
    pub async fn configure_search(&mut self) -> anyhow::Result<()> {
        self.driver.goto(&format!("{BASE_URL}search")).await?;

        for member in &self.members {
            self.add_member_filter(member).await?;
            self.wait_for_filter_chip(member).await?;
        }

        let join_date = self.min_join_date().await?;
        self.join_date = Some(join_date);

        // Dismiss the member picker so the date inputs are reachable.
        self.driver
            .find(Locator::XPath("/html/body/div[10]/div[11]/div/button"))
            .await?
            .click()
            .await?;

        self.driver
            .find(Locator::XPath(r#"//*[contains(@id,"when_between_start_input")]"#))
            .await?
            .send_keys(&format_mdy(join_date))
            .await?;
        self.driver
            .find(Locator::XPath(r#"//*[contains(@id,"when_between_end_input")]"#))
            .await?
            .send_keys(&format_mdy(self.cursor))
            .await?;

        self.driver
            .find(Locator::Css(r#"[name="search"]"#))
            .await?
            .click()
            .await?;

        tracing::info!(target: "worker", "searching...");
        Ok(())
    }

    /// Type a member name into the filter box and confirm the suggestion.
    async fn add_member_filter(&self, member: &CompactString) -> anyhow::Result<()> {
        self.driver
            .find(Locator::Css(r#"[name="who_at_least_one_placeholder"]"#))
            .await?
            .click()
            .await?;

        let search_box = self
            .driver
            .find(Locator::Css(r#"[name="user_search_box_input"]"#))
            .await?;
        search_box.send_keys(member).await?;

        let suggestion = self
            .driver
            .wait()
            .at_most(TYPEAHEAD_TIMEOUT)
            .for_element(Locator::Css(".ui-selectlist-item"))
            .await;
        if let Err(e) = suggestion {
            return Err(if matches!(e, CmdError::WaitTimeout) {
                SessionError::MemberNotFound(member.clone()).into()
            } else {
                e.into()
            });
        }

        // Let the suggestion list settle before confirming.
        sleep(TYPEAHEAD_SETTLE).await;
        search_box
            .send_keys(&char::from(Key::Enter).to_string())
            .await
            .map_err(Into::into)
    }

    /// Poll until the confirmed member shows up in the filter chip list.
    async fn wait_for_filter_chip(&self, member: &str) -> anyhow::Result<()> {
        const PERIOD: Duration = Duration::from_millis(250);

        let deadline = tokio::time::Instant::now() + TYPEAHEAD_TIMEOUT;
        loop {
            if let Ok(chip) = self.driver.find(Locator::Id("user-search-0")).await {
                if chip.text().await?.contains(member) {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("member {member:?} never appeared in the filter list");
            }
            sleep(PERIOD).await;
        }
    }

    /// Visit each selected member's profile in its own window and take the
    /// earliest join date, so the search window starts when the first of them
    /// signed up rather than at some arbitrary date.
    async fn min_join_date(&self) -> anyhow::Result<DateTime<Utc>> {
        let links = self
            .driver
            .find_all(Locator::XPath(r#"//*[@id="user-search-0"]//*/a"#))
            .await?;
        let mut hrefs = Vec::with_capacity(links.len());
        for link in &links {
            if let Some(href) = link.attr("href").await? {
                hrefs.push(href);
            }
        }

        let home = self.driver.window().await?;
        let mut minimum = Utc::now();
        for href in hrefs {
            let handle = self.driver.new_window(true).await?.handle;
            self.driver.switch_to_window(handle).await?;
            self.driver.goto(&href).await?;

            let stamp = self
                .driver
                .find(Locator::XPath(r#"//td/abbr[@class="o-timestamp time"]"#))
                .await?
                .attr("data-timestamp")
                .await?
                .ok_or_else(|| anyhow::anyhow!("profile page has no join timestamp"))?;
            let join = parse_timestamp_millis(&stamp)
                .ok_or_else(|| anyhow::anyhow!("bad profile timestamp {stamp:?}"))?;

            if join < minimum {
                minimum = join;
            }

            self.driver.close_window().await?;
            self.driver.switch_to_window(home.clone()).await?;
        }

        Ok(minimum)
    }

    /// Fetch one results page and advance the search. Returns `None` forever
    /// once the cursor has moved back to the earliest join date.
    ///
    /// Any webdriver error during the page step is retried after a fixed
    /// delay by re-navigating to the last known URL, with no attempt cap.
    /// A page's records are only returned after the whole step succeeds, so
    /// a retried page never yields duplicates.
    pub async fn next_page(&mut self) -> anyhow::Result<Option<Vec<Post>>> {
        if self.done {
            return Ok(None);
        }
        let Some(join_date) = self.join_date else {
            anyhow::bail!("the search was never configured");
        };

        loop {
            match self.process_page(join_date).await {
                Ok(posts) => {
                    if reached_end(self.cursor, join_date) {
                        tracing::info!(target: "worker", "\x1b[36mreached the end!\x1b[0m");
                        self.done = true;
                    }
                    return Ok(Some(posts));
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!(target: "worker", "transient fetch error: {e:?}, trying again...");
                    sleep(RETRY_DELAY).await;
                    if let Some(url) = &self.last_url {
                        self.driver.goto(url.as_str()).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn process_page(&mut self, join_date: DateTime<Utc>) -> anyhow::Result<Vec<Post>> {
        self.driver
            .wait()
            .forever()
            .for_element(Locator::Css(".ui-pagination"))
            .await?;
        self.last_url = Some(self.driver.current_url().await?);

        let html = self.driver.source().await?;
        let (posts, disabled) = {
            let document = Html::parse_document(&html);
            (self.sel.posts(&document), self.sel.next_disabled(&document))
        };

        if disabled {
            // The forum caps how many pages one query returns; restart from
            // page 1 with the window narrowed to the oldest post seen.
            let Some(oldest) = posts.iter().map(|p| p.timestamp).min() else {
                anyhow::bail!("results page has no timestamps to narrow the search by");
            };
            self.cursor = oldest;
            self.issue_new_search(join_date).await?;
        } else {
            self.driver
                .find(Locator::Css(".ui-pagination li:last-child"))
                .await?
                .click()
                .await?;
        }

        sleep(PAGE_DELAY).await;
        Ok(posts)
    }

    async fn issue_new_search(&mut self, join_date: DateTime<Utc>) -> anyhow::Result<()> {
        let current = self.driver.current_url().await?;
        let url = with_search_window(current, join_date, self.cursor);

        tracing::info!(
            target: "worker",
            "issuing new search for posts on and before {}...", self.cursor,
        );

        self.last_url = Some(url.clone());
        self.driver.goto(url.as_str()).await.map_err(Into::into)
    }

    /// End the webdriver session and reap the driver process.
    pub async fn close(mut self) -> anyhow::Result<()> {
        self.driver.close().await?;
        self.process.kill().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use scraper::Html;
    use url::Url;

    use super::{Selectors, reached_end, with_search_window};

    const RESULTS_PAGE: &str = r##"<html><body>
        <div class="container results">
            <article>
                <div class="head">
                    <abbr class="o-timestamp time" data-timestamp="1425254400000">Mar 2, 2015</abbr>
                </div>
                <h1><a href="/thread/1234/welcome?page=3">Welcome thread</a></h1>
                <div class="message">Hello <b>world</b></div>
            </article>
            <article>
                <div class="head">
                    <abbr class="o-timestamp time" data-timestamp="1425168000000">Mar 1, 2015</abbr>
                </div>
                <h1><a href="/thread/987/rules">Rules</a></h1>
                <div class="message">Read these ~ first</div>
            </article>
            <article>
                <div class="head"><span>no timestamp here</span></div>
                <h1><a href="/thread/555/broken">Broken</a></h1>
                <div class="message">skipped</div>
            </article>
        </div>
        <ul class="ui-pagination">
            <li class="prev">&laquo;</li>
            <li>1</li>
            <li class="next">&raquo;</li>
        </ul>
    </body></html>"##;

    #[test]
    fn extracts_posts_in_document_order() {
        let document = Html::parse_document(RESULTS_PAGE);
        let posts = Selectors::new().posts(&document);

        assert_eq!(posts.len(), 2);

        assert_eq!(
            posts[0].timestamp,
            Utc.with_ymd_and_hms(2015, 3, 2, 0, 0, 0).unwrap(),
        );
        assert_eq!(posts[0].thread_name, "Welcome thread");
        assert_eq!(posts[0].thread_id, 1234);
        assert_eq!(posts[0].text, "Hello <b>world</b>");

        assert_eq!(posts[1].thread_id, 987);
        assert_eq!(posts[1].text, "Read these ~ first");
    }

    #[test]
    fn cursor_narrows_to_the_oldest_visible_timestamp() {
        let document = Html::parse_document(RESULTS_PAGE);
        let posts = Selectors::new().posts(&document);

        assert_eq!(
            posts.iter().map(|p| p.timestamp).min(),
            Some(Utc.with_ymd_and_hms(2015, 3, 1, 0, 0, 0).unwrap()),
        );
    }

    #[test]
    fn next_control_state_comes_from_the_last_pagination_item() {
        let document = Html::parse_document(RESULTS_PAGE);
        assert!(!Selectors::new().next_disabled(&document));

        let document = Html::parse_document(
            r#"<ul class="ui-pagination"><li>1</li><li class="next state-disabled">&raquo;</li></ul>"#,
        );
        assert!(Selectors::new().next_disabled(&document));
    }

    #[test]
    fn new_search_rewrites_the_window_and_resets_the_page() {
        let url = Url::parse(
            "http://abyssc.proboards.com/search/results?captcha_id=abc&who_at_least_one=9\
             &when_between_start=03%2F01%2F2015&when_between_end=01%2F01%2F2024&page=7",
        )
        .unwrap();

        let out = with_search_window(
            url,
            Utc.with_ymd_and_hms(2015, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2016, 5, 4, 12, 0, 0).unwrap(),
        );

        let pairs: Vec<(String, String)> = out
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            [
                ("captcha_id".to_owned(), "abc".to_owned()),
                ("who_at_least_one".to_owned(), "9".to_owned()),
                ("when_between_start".to_owned(), "03/01/2015".to_owned()),
                ("when_between_end".to_owned(), "05/04/2016".to_owned()),
                ("page".to_owned(), "1".to_owned()),
            ],
        );
    }

    #[test]
    fn the_window_closes_on_the_join_date_calendar_day() {
        let join = Utc.with_ymd_and_hms(2015, 3, 1, 8, 30, 0).unwrap();

        // Later the same day still counts as reaching the end.
        assert!(reached_end(Utc.with_ymd_and_hms(2015, 3, 1, 23, 59, 0).unwrap(), join));
        assert!(reached_end(Utc.with_ymd_and_hms(2014, 12, 31, 0, 0, 0).unwrap(), join));
        assert!(!reached_end(Utc.with_ymd_and_hms(2015, 3, 2, 0, 0, 0).unwrap(), join));
    }
}
