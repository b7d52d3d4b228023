//! Following a seller or brand listing across its pages

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::extract::CatalogExtractor;
use crate::models::ProductLink;

/// Something that can load a listing page and hand back its source
#[async_trait]
pub trait ListingPages: Send + Sync {
    /// Source of the page at `url`, with all lazily loaded cards present
    async fn listing_html(&self, url: &str) -> Result<String>;
}

/// Collect product links from `seller_url` and the pages after it.
///
/// Stops when there is no next page, when the next page is the current one,
/// or after `max_pages` pages.
pub async fn walk_catalog<P>(
    pages: &P,
    extractor: &CatalogExtractor,
    seller_url: &str,
    max_pages: u32,
) -> Result<Vec<ProductLink>>
where
    P: ListingPages + ?Sized,
{
    let mut links = Vec::new();
    let mut seen = HashSet::new();
    let mut current_url = seller_url.to_string();
    let mut page_num = 1;

    loop {
        if page_num > max_pages {
            info!("Reached maximum page limit ({}) for {}", max_pages, seller_url);
            break;
        }

        info!("Fetching catalog page {} of {}", page_num, seller_url);
        let html = pages.listing_html(&current_url).await?;
        let page = extractor.extract_catalog(&html, &current_url);

        let before = links.len();
        for entry in page.links {
            if seen.insert(entry.article.clone()) {
                links.push(ProductLink {
                    article: entry.article,
                    title: entry.name,
                    url: entry.url,
                });
            }
        }
        info!("Page {}: {} new products, {} total", page_num, links.len() - before, links.len());

        match page.next_page {
            Some(next_url) if next_url != current_url => {
                current_url = next_url;
                page_num += 1;
            }
            _ => break,
        }
    }

    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::CatalogSelectors;
    use anyhow::Context;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const SELLER: &str = "https://www.wildberries.ru/seller/4242";

    struct FakeListing {
        pages: HashMap<String, String>,
        visited: Mutex<Vec<String>>,
    }

    impl FakeListing {
        fn new(pages: &[(&str, String)]) -> Self {
            Self {
                pages: pages.iter().map(|(u, h)| (u.to_string(), h.clone())).collect(),
                visited: Mutex::new(Vec::new()),
            }
        }

        fn visited(&self) -> Vec<String> {
            self.visited.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ListingPages for FakeListing {
        async fn listing_html(&self, url: &str) -> Result<String> {
            self.visited.lock().unwrap().push(url.to_string());
            self.pages.get(url).cloned().context("no such page")
        }
    }

    fn listing(ids: &[u64], next: Option<&str>) -> String {
        let cards: String = ids
            .iter()
            .map(|id| format!(r#"<div data-nm-id="{id}"><a aria-label="Товар {id}"></a></div>"#))
            .collect();
        let next = next
            .map(|url| format!(r#"<a class="pagination-next" href="{url}">Дальше</a>"#))
            .unwrap_or_default();
        format!("<html><body>{cards}{next}</body></html>")
    }

    fn extractor() -> CatalogExtractor {
        CatalogExtractor::new(&CatalogSelectors::default()).unwrap()
    }

    fn page_url(n: u32) -> String {
        format!("{SELLER}?page={n}")
    }

    #[tokio::test]
    async fn pages_are_followed_until_the_last_one() {
        let second = page_url(2);
        let fake = FakeListing::new(&[
            (SELLER, listing(&[1, 2], Some(&second))),
            (second.as_str(), listing(&[2, 3], None)),
        ]);

        let links = walk_catalog(&fake, &extractor(), SELLER, 10).await.unwrap();

        let articles: Vec<_> = links.iter().map(|l| l.article.as_str()).collect();
        assert_eq!(articles, ["1", "2", "3"]);
        assert_eq!(links[0].title.as_deref(), Some("Товар 1"));
        assert_eq!(fake.visited(), [SELLER.to_string(), second]);
    }

    #[tokio::test]
    async fn a_next_link_to_the_same_page_ends_the_walk() {
        let fake = FakeListing::new(&[(SELLER, listing(&[1], Some(SELLER)))]);

        let links = walk_catalog(&fake, &extractor(), SELLER, 10).await.unwrap();

        assert_eq!(links.len(), 1);
        assert_eq!(fake.visited().len(), 1);
    }

    #[tokio::test]
    async fn the_page_limit_is_respected() {
        let urls: Vec<String> = (1..=5).map(page_url).collect();
        let pages: Vec<(&str, String)> = urls
            .iter()
            .enumerate()
            .map(|(i, url)| (url.as_str(), listing(&[i as u64 + 1], urls.get(i + 1).map(String::as_str))))
            .collect();
        let fake = FakeListing::new(&pages);

        let links = walk_catalog(&fake, &extractor(), &urls[0], 3).await.unwrap();

        assert_eq!(links.len(), 3);
        assert_eq!(fake.visited(), urls[..3]);
    }

    #[tokio::test]
    async fn a_page_that_fails_to_load_is_an_error() {
        let fake = FakeListing::new(&[(SELLER, listing(&[1], Some(&page_url(2))))]);

        assert!(walk_catalog(&fake, &extractor(), SELLER, 10).await.is_err());
    }
}
