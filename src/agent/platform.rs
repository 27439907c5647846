//! Platform strategies: where things are on a messaging page
//!
//! The agent never looks at page structure directly. A strategy reads a
//! `PageSnapshot` and answers the handful of questions the state machine
//! asks. Swapping platforms means swapping the strategy.

use std::sync::Arc;

use super::event::ConversationalEvent;
use crate::surface::{ElementRef, PageElement, PageSnapshot};

/// An inbox row that needs attention
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub counterpart: String,
    pub element: ElementRef,
    /// Found in the platform's priority channel
    pub priority: bool,
}

pub trait PlatformStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the page shows the conversation list
    fn is_conversation_view(&self, page: &PageSnapshot) -> bool;

    /// Where to go to reach the conversation list, if the page says
    fn conversation_view_url(&self, page: &PageSnapshot) -> Option<String>;

    /// Unread conversations in scan order, priority channel first.
    /// When the priority channel has any, only those are returned.
    fn find_unread_conversations(&self, page: &PageSnapshot) -> Vec<Conversation>;

    /// Counterpart of the conversation currently open
    fn active_counterpart(&self, page: &PageSnapshot) -> Option<String>;

    /// Latest message in the open conversation, if it belongs to
    /// `expected_counterpart`
    fn extract_latest_incoming(
        &self,
        page: &PageSnapshot,
        expected_counterpart: &str,
        own_handle: Option<&str>,
    ) -> Option<ConversationalEvent>;

    fn locate_input_control(&self, page: &PageSnapshot) -> Option<ElementRef>;

    fn locate_submit_control(&self, page: &PageSnapshot) -> Option<ElementRef>;
}

/// Generic strategy over ARIA roles
///
/// Conversation rows are `listitem`s carrying `counterpart`/`unread`/`channel`
/// attributes, the open thread has a `heading` naming the counterpart, messages
/// are `article`s with `author` and `direction`, the composer is a `textbox`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AriaInboxStrategy;

impl AriaInboxStrategy {
    fn inbox_link(page: &PageSnapshot) -> Option<&PageElement> {
        page.by_role("link").find(|e| e.attr("rel") == Some("inbox"))
    }
}

impl PlatformStrategy for AriaInboxStrategy {
    fn name(&self) -> &'static str {
        "aria-inbox"
    }

    fn is_conversation_view(&self, page: &PageSnapshot) -> bool {
        match Self::inbox_link(page).and_then(|link| link.attr("href")) {
            Some(href) => page.url.starts_with(href),
            None => page
                .by_role("listitem")
                .any(|e| e.attr("counterpart").is_some()),
        }
    }

    fn conversation_view_url(&self, page: &PageSnapshot) -> Option<String> {
        Self::inbox_link(page)
            .and_then(|link| link.attr("href"))
            .map(str::to_string)
    }

    fn find_unread_conversations(&self, page: &PageSnapshot) -> Vec<Conversation> {
        let (priority, inbox): (Vec<_>, Vec<_>) = page
            .by_role("listitem")
            .filter(|e| e.has_flag("unread"))
            .filter_map(|e| {
                let counterpart = e.attr("counterpart")?.to_string();
                Some(Conversation {
                    counterpart,
                    element: e.element.clone(),
                    priority: e.attr("channel") == Some("priority"),
                })
            })
            .partition(|c| c.priority);

        if priority.is_empty() {
            inbox
        } else {
            priority
        }
    }

    fn active_counterpart(&self, page: &PageSnapshot) -> Option<String> {
        page.by_role("heading")
            .find_map(|e| e.attr("counterpart"))
            .map(str::to_string)
    }

    fn extract_latest_incoming(
        &self,
        page: &PageSnapshot,
        expected_counterpart: &str,
        own_handle: Option<&str>,
    ) -> Option<ConversationalEvent> {
        // A header naming someone else means the pane has not caught up yet
        if self.active_counterpart(page)? != expected_counterpart {
            return None;
        }
        let latest = page.by_role("article").last()?;
        if latest.text.trim().is_empty() {
            return None;
        }
        let author = latest.attr("author").unwrap_or(expected_counterpart);
        let from_self = latest.attr("direction") == Some("outgoing")
            || own_handle.map_or(false, |own| own.eq_ignore_ascii_case(author));
        Some(ConversationalEvent::new(
            expected_counterpart,
            author,
            &latest.text,
            latest.element.clone(),
            from_self,
        ))
    }

    fn locate_input_control(&self, page: &PageSnapshot) -> Option<ElementRef> {
        page.by_role("textbox").next().map(|e| e.element.clone())
    }

    fn locate_submit_control(&self, page: &PageSnapshot) -> Option<ElementRef> {
        page.by_role("button")
            .find(|e| e.text.trim().eq_ignore_ascii_case("send") || e.attr("type") == Some("submit"))
            .map(|e| e.element.clone())
    }
}

/// Strategy lookup keyed by the page's host
pub struct PlatformRegistry {
    strategies: Vec<(String, Arc<dyn PlatformStrategy>)>,
    fallback: Arc<dyn PlatformStrategy>,
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self {
            strategies: Vec::new(),
            fallback: Arc::new(AriaInboxStrategy),
        }
    }
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `strategy` for `host` and its subdomains
    pub fn register(&mut self, host: impl Into<String>, strategy: Arc<dyn PlatformStrategy>) {
        self.strategies.push((host.into().to_lowercase(), strategy));
    }

    pub fn for_url(&self, page_url: &str) -> Arc<dyn PlatformStrategy> {
        let host = url::Url::parse(page_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase));
        if let Some(host) = host {
            for (suffix, strategy) in &self.strategies {
                if host == *suffix || host.ends_with(&format!(".{}", suffix)) {
                    return Arc::clone(strategy);
                }
            }
        }
        Arc::clone(&self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn element(id: &str, role: &str, text: &str, attrs: &[(&str, &str)]) -> PageElement {
        PageElement {
            element: ElementRef::new(id),
            role: role.to_string(),
            text: text.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn inbox(rows: &[(&str, bool, bool)]) -> PageSnapshot {
        let mut elements = vec![element(
            "nav",
            "link",
            "Messages",
            &[("rel", "inbox"), ("href", "https://chat.example.com/inbox")],
        )];
        for (i, (who, unread, priority)) in rows.iter().enumerate() {
            elements.push(element(
                &format!("row{}", i),
                "listitem",
                who,
                &[
                    ("counterpart", who),
                    ("unread", if *unread { "true" } else { "false" }),
                    ("channel", if *priority { "priority" } else { "inbox" }),
                ],
            ));
        }
        PageSnapshot {
            url: "https://chat.example.com/inbox".to_string(),
            elements,
        }
    }

    #[test]
    fn test_unread_in_scan_order() {
        let page = inbox(&[("alice", true, false), ("bob", false, false), ("carol", true, false)]);
        let found = AriaInboxStrategy.find_unread_conversations(&page);
        let names: Vec<_> = found.iter().map(|c| c.counterpart.as_str()).collect();
        assert_eq!(names, vec!["alice", "carol"]);
    }

    #[test]
    fn test_priority_channel_takes_precedence() {
        let page = inbox(&[("alice", true, false), ("bob", true, true)]);
        let found = AriaInboxStrategy.find_unread_conversations(&page);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].counterpart, "bob");
        assert!(found[0].priority);
    }

    #[test]
    fn test_conversation_view_detection() {
        let mut page = inbox(&[]);
        assert!(AriaInboxStrategy.is_conversation_view(&page));
        page.url = "https://chat.example.com/home".to_string();
        assert!(!AriaInboxStrategy.is_conversation_view(&page));
        assert_eq!(
            AriaInboxStrategy.conversation_view_url(&page).as_deref(),
            Some("https://chat.example.com/inbox")
        );
    }

    #[test]
    fn test_extract_rejects_mismatched_header() {
        let mut page = inbox(&[]);
        page.elements.push(element("h", "heading", "bob", &[("counterpart", "bob")]));
        page.elements.push(element(
            "m",
            "article",
            "hi",
            &[("author", "bob"), ("direction", "incoming")],
        ));
        assert!(AriaInboxStrategy
            .extract_latest_incoming(&page, "alice", None)
            .is_none());
        let event = AriaInboxStrategy
            .extract_latest_incoming(&page, "bob", None)
            .unwrap();
        assert!(!event.from_self);
    }

    #[test]
    fn test_extract_flags_own_messages() {
        let mut page = inbox(&[]);
        page.elements.push(element("h", "heading", "bob", &[("counterpart", "bob")]));
        page.elements.push(element("m", "article", "hey", &[("author", "Me")]));
        let event = AriaInboxStrategy
            .extract_latest_incoming(&page, "bob", Some("me"))
            .unwrap();
        assert!(event.from_self);
    }

    #[test]
    fn test_registry_matches_host_and_subdomains() {
        struct Named;
        impl PlatformStrategy for Named {
            fn name(&self) -> &'static str {
                "named"
            }
            fn is_conversation_view(&self, _: &PageSnapshot) -> bool {
                false
            }
            fn conversation_view_url(&self, _: &PageSnapshot) -> Option<String> {
                None
            }
            fn find_unread_conversations(&self, _: &PageSnapshot) -> Vec<Conversation> {
                Vec::new()
            }
            fn active_counterpart(&self, _: &PageSnapshot) -> Option<String> {
                None
            }
            fn extract_latest_incoming(
                &self,
                _: &PageSnapshot,
                _: &str,
                _: Option<&str>,
            ) -> Option<ConversationalEvent> {
                None
            }
            fn locate_input_control(&self, _: &PageSnapshot) -> Option<ElementRef> {
                None
            }
            fn locate_submit_control(&self, _: &PageSnapshot) -> Option<ElementRef> {
                None
            }
        }

        let mut registry = PlatformRegistry::new();
        registry.register("example.org", Arc::new(Named));
        assert_eq!(registry.for_url("https://m.example.org/dm").name(), "named");
        assert_eq!(registry.for_url("https://example.org").name(), "named");
        assert_eq!(registry.for_url("https://notexample.org").name(), "aria-inbox");
        assert_eq!(registry.for_url("about:blank").name(), "aria-inbox");
    }
}
