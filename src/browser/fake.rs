// In-memory browser for tests: pages keyed by URL, elements matched by selector.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Browser, Cookie, ElementId, Selector};
use crate::error::BrowserError;

#[derive(Debug, Clone)]
pub(crate) enum FakeAction {
    Goto(String),
    /// Go to `accepted` when the element's typed value equals `expected`
    CheckTyped {
        expected: String,
        accepted: String,
        rejected: String,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct FakeElement {
    selector: Selector,
    attributes: HashMap<String, String>,
    text: String,
    on_click: Option<FakeAction>,
    on_submit: Option<FakeAction>,
}

impl FakeElement {
    pub(crate) fn new(selector: Selector) -> Self {
        FakeElement {
            selector,
            attributes: HashMap::new(),
            text: String::new(),
            on_click: None,
            on_submit: None,
        }
    }

    pub(crate) fn attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub(crate) fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub(crate) fn on_click(mut self, url: &str) -> Self {
        self.on_click = Some(FakeAction::Goto(url.to_string()));
        self
    }

    pub(crate) fn on_submit(mut self, action: FakeAction) -> Self {
        self.on_submit = Some(action);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakePage {
    elements: Vec<FakeElement>,
    source: String,
    redirect: Option<String>,
}

impl FakePage {
    pub(crate) fn new() -> Self {
        FakePage::default()
    }

    pub(crate) fn redirect(url: &str) -> Self {
        FakePage {
            redirect: Some(url.to_string()),
            ..FakePage::default()
        }
    }

    pub(crate) fn with(mut self, element: FakeElement) -> Self {
        self.elements.push(element);
        self
    }

    pub(crate) fn source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }
}

#[derive(Default)]
struct FakeState {
    pages: HashMap<String, FakePage>,
    current: String,
    typed: HashMap<String, String>,
    events: Vec<String>,
    find_failures: HashMap<Selector, u32>,
    cookies: Vec<Cookie>,
    downloads: HashMap<String, (PathBuf, Vec<u8>)>,
    quit: bool,
}

impl FakeState {
    fn page(&self) -> Option<&FakePage> {
        self.pages.get(&self.current)
    }

    fn element(&self, id: &ElementId) -> Result<&FakeElement, BrowserError> {
        let stale = || BrowserError::StaleElement { selector: id.0.clone() };
        let (url, index) = id.0.rsplit_once('#').ok_or_else(stale)?;
        if url != self.current {
            return Err(stale());
        }
        let index: usize = index.parse().map_err(|_| stale())?;
        self.page().and_then(|p| p.elements.get(index)).ok_or_else(stale)
    }

    fn goto(&mut self, url: &str) {
        let mut target = url.to_string();
        // Follow at most a few redirects
        for _ in 0..5 {
            match self.pages.get(&target).and_then(|p| p.redirect.clone()) {
                Some(next) => target = next,
                None => break,
            }
        }

        if let Some((path, bytes)) = self.downloads.get(url) {
            let _ = std::fs::write(path, bytes);
            self.events.push(format!("download {}", url));
            return;
        }

        self.current = target;
    }

    fn run(&mut self, action: FakeAction, element: &ElementId) {
        match action {
            FakeAction::Goto(url) => self.goto(&url),
            FakeAction::CheckTyped { expected, accepted, rejected } => {
                let typed = self.typed.get(&element.0).cloned().unwrap_or_default();
                if typed == expected {
                    self.goto(&accepted);
                } else {
                    self.goto(&rejected);
                }
            }
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeBrowser {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBrowser {
    pub(crate) fn new() -> Self {
        FakeBrowser::default()
    }

    pub(crate) fn add_page(&self, url: &str, page: FakePage) {
        self.state.lock().unwrap().pages.insert(url.to_string(), page);
    }

    /// The next `times` lookups of `selector` report not-found.
    pub(crate) fn fail_finds(&self, selector: &Selector, times: u32) {
        self.state.lock().unwrap().find_failures.insert(selector.clone(), times);
    }

    pub(crate) fn set_cookies(&self, cookies: Vec<Cookie>) {
        self.state.lock().unwrap().cookies = cookies;
    }

    /// Navigating to `url` drops `bytes` into `path` instead of changing page.
    pub(crate) fn add_download(&self, url: &str, path: PathBuf, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .downloads
            .insert(url.to_string(), (path, bytes.to_vec()));
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub(crate) fn typed_into(&self, selector: &Selector) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.strip_prefix(&format!("type {} ", selector)).map(str::to_string))
            .collect()
    }

    pub(crate) fn current(&self) -> String {
        self.state.lock().unwrap().current.clone()
    }

    pub(crate) fn quit_called(&self) -> bool {
        self.state.lock().unwrap().quit
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("goto {}", url));
        state.goto(url);
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.current())
    }

    async fn find(&self, selector: &Selector) -> Result<ElementId, BrowserError> {
        let mut state = self.state.lock().unwrap();

        if let Some(remaining) = state.find_failures.get_mut(selector) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BrowserError::ElementNotFound { selector: selector.to_string() });
            }
        }

        let index = state
            .page()
            .and_then(|p| p.elements.iter().position(|e| &e.selector == selector))
            .ok_or_else(|| BrowserError::ElementNotFound { selector: selector.to_string() })?;

        Ok(ElementId(format!("{}#{}", state.current, index)))
    }

    async fn find_all(&self, selector: &Selector) -> Result<Vec<ElementId>, BrowserError> {
        let state = self.state.lock().unwrap();
        let Some(page) = state.page() else {
            return Ok(Vec::new());
        };
        Ok(page
            .elements
            .iter()
            .enumerate()
            .filter(|(_, e)| &e.selector == selector)
            .map(|(i, _)| ElementId(format!("{}#{}", state.current, i)))
            .collect())
    }

    async fn find_within(&self, parent: &ElementId, selector: &Selector) -> Result<ElementId, BrowserError> {
        self.state.lock().unwrap().element(parent)?;
        self.find(selector).await
    }

    async fn click(&self, element: &ElementId) -> Result<(), BrowserError> {
        let mut state = self.state.lock().unwrap();
        let found = state.element(element)?;
        let selector = found.selector.to_string();
        let action = found.on_click.clone();

        state.events.push(format!("click {}", selector));
        if let Some(action) = action {
            state.run(action, element);
        }
        Ok(())
    }

    async fn send_keys(&self, element: &ElementId, text: &str) -> Result<(), BrowserError> {
        let mut state = self.state.lock().unwrap();
        let selector = state.element(element)?.selector.to_string();

        state.events.push(format!("type {} {}", selector, text));
        state.typed.entry(element.0.clone()).or_default().push_str(text);
        Ok(())
    }

    async fn submit(&self, element: &ElementId) -> Result<(), BrowserError> {
        let mut state = self.state.lock().unwrap();
        let found = state.element(element)?;
        let selector = found.selector.to_string();
        let action = found.on_submit.clone();

        state.events.push(format!("submit {}", selector));
        if let Some(action) = action {
            state.run(action, element);
        }
        state.typed.remove(&element.0);
        Ok(())
    }

    async fn attribute(&self, element: &ElementId, name: &str) -> Result<Option<String>, BrowserError> {
        let state = self.state.lock().unwrap();
        Ok(state.element(element)?.attributes.get(name).cloned())
    }

    async fn text(&self, element: &ElementId) -> Result<String, BrowserError> {
        let state = self.state.lock().unwrap();
        Ok(state.element(element)?.text.clone())
    }

    async fn page_source(&self) -> Result<String, BrowserError> {
        let state = self.state.lock().unwrap();
        Ok(state.page().map(|p| p.source.clone()).unwrap_or_default())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError> {
        Ok(self.state.lock().unwrap().cookies.clone())
    }

    async fn quit(&self) -> Result<(), BrowserError> {
        self.state.lock().unwrap().quit = true;
        Ok(())
    }
}
