//! Tab registry
//!
//! Each tab is an independent browsing context that issues its requests
//! through the gateway. Ordering follows insertion and can be rearranged.

use serde::Serialize;
use url::Url;

/// Search used when address-bar input is not a URL.
pub const SEARCH_URL: &str = "https://duckduckgo.com/?q=";

pub type TabId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tab {
    pub id: TabId,
    pub title: String,
    pub url: Option<Url>,
}

impl Tab {
    fn new(id: TabId) -> Self {
        Self {
            id,
            title: "New Tab".into(),
            url: None,
        }
    }
}

#[derive(Debug)]
pub struct TabRegistry {
    tabs: Vec<Tab>,
    active: Option<TabId>,
    next_id: TabId,
}

impl TabRegistry {
    pub fn new() -> Self {
        Self {
            tabs: Vec::new(),
            active: None,
            next_id: 1,
        }
    }

    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    pub fn create_tab(&mut self, make_active: bool) -> TabId {
        let id = self.next_id;
        self.next_id += 1;
        self.tabs.push(Tab::new(id));
        if make_active {
            self.active = Some(id);
        }
        id
    }

    pub fn get(&self, id: TabId) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.id == id)
    }

    pub fn active_id(&self) -> Option<TabId> {
        self.active
    }

    pub fn active(&self) -> Option<&Tab> {
        self.active.and_then(|id| self.get(id))
    }

    /// Returns false if no tab has that id.
    pub fn switch_tab(&mut self, id: TabId) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        self.active = Some(id);
        true
    }

    /// Close a tab. The neighbour at the same position becomes active; closing
    /// the last tab opens a fresh one so there is always something to show.
    pub fn close_tab(&mut self, id: TabId) -> bool {
        let Some(index) = self.tabs.iter().position(|t| t.id == id) else {
            return false;
        };
        self.tabs.remove(index);

        if self.active == Some(id) {
            if self.tabs.is_empty() {
                self.active = None;
                self.create_tab(true);
            } else {
                let next = index.min(self.tabs.len() - 1);
                self.active = Some(self.tabs[next].id);
            }
        }
        true
    }

    /// Move the tab at `from` to position `to`.
    pub fn move_tab(&mut self, from: usize, to: usize) -> bool {
        if from >= self.tabs.len() || to >= self.tabs.len() {
            return false;
        }
        if from != to {
            let tab = self.tabs.remove(from);
            self.tabs.insert(to, tab);
        }
        true
    }

    /// Point the active tab at whatever `input` resolves to.
    pub fn navigate(&mut self, input: &str) -> Option<Url> {
        let url = resolve_input(input)?;
        let id = self.active?;
        let tab = self.tabs.iter_mut().find(|t| t.id == id)?;
        tab.title = url.host_str().unwrap_or("New Tab").to_string();
        tab.url = Some(url.clone());
        Some(url)
    }
}

impl Default for TabRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn address-bar input into a URL: explicit `http(s)` URLs are kept,
/// host-looking input gets `https://`, anything else is a search.
pub fn resolve_input(input: &str) -> Option<Url> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let decoded = urlencoding::decode(input)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| input.to_string());

    let lower = decoded.to_ascii_lowercase();
    let candidate = if lower.starts_with("http://") || lower.starts_with("https://") {
        decoded.clone()
    } else if decoded.contains('.') && !decoded.contains(' ') {
        format!("https://{}", decoded)
    } else {
        return search_url(&decoded);
    };

    Url::parse(&candidate).ok().or_else(|| search_url(&decoded))
}

fn search_url(query: &str) -> Option<Url> {
    Url::parse(&format!("{}{}", SEARCH_URL, urlencoding::encode(query))).ok()
}
