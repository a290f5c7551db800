//! In-memory document and the DOM helper handed to test code.
//!
//! [`Document`] is a plain element tree with just enough behaviour for the
//! harness: simple selector queries, classes and attributes, form state,
//! focus, inline-style visibility and bubbling event listeners. Test logic
//! talks to it through the cloneable [`Doc`] handle and [`Elem`] wrappers,
//! which mirror the query/element capability set of a browser DOM helper.
//!
//! Markup is parsed with `quick-xml`, so fixtures must be well-formed
//! (`<input type="checkbox"/>`, quoted attribute values).

use crate::result::{HarnessError, HarnessResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Index of a node inside its [`Document`]
pub type NodeId = usize;

/// Most recent events kept in a document's dispatch log
pub const DISPATCH_LOG_LIMIT: usize = 256;

type Handler = Arc<dyn Fn(&Elem, &DomEvent) + Send + Sync>;

#[derive(Debug, Clone)]
enum NodeData {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    value: String,
    checked: bool,
}

/// Extra modifiers for key events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyModifiers {
    /// Alt held
    pub alt: bool,
    /// Control held
    pub ctrl: bool,
    /// Shift held
    pub shift: bool,
    /// Meta held
    pub meta: bool,
}

impl KeyModifiers {
    /// No modifiers
    #[must_use]
    pub const fn none() -> Self {
        Self {
            alt: false,
            ctrl: false,
            shift: false,
            meta: false,
        }
    }

    /// With shift
    #[must_use]
    pub const fn shift(mut self) -> Self {
        self.shift = true;
        self
    }

    /// With control
    #[must_use]
    pub const fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    /// With alt
    #[must_use]
    pub const fn alt(mut self) -> Self {
        self.alt = true;
        self
    }

    /// With meta
    #[must_use]
    pub const fn meta(mut self) -> Self {
        self.meta = true;
        self
    }
}

/// Kind of a synthetic event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Mouse click
    Click,
    /// Key released
    KeyUp {
        /// Key code
        code: u32,
        /// Modifiers
        mods: KeyModifiers,
    },
    /// Key pressed
    KeyDown {
        /// Key code
        code: u32,
        /// Modifiers
        mods: KeyModifiers,
    },
    /// Field value changed by typing
    Input,
    /// Checkbox state changed
    Change,
    /// Element received focus
    Focus,
}

impl EventKind {
    /// DOM event type name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::KeyUp { .. } => "keyup",
            Self::KeyDown { .. } => "keydown",
            Self::Input => "input",
            Self::Change => "change",
            Self::Focus => "focus",
        }
    }

    /// Whether listeners on ancestors see the event
    #[must_use]
    pub const fn bubbles(&self) -> bool {
        !matches!(self, Self::Change | Self::Focus)
    }
}

/// An event dispatched to an element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomEvent {
    /// Event kind
    pub kind: EventKind,
    /// Element the event was dispatched on
    pub target: NodeId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.id.is_none() && self.classes.is_empty() && self.attrs.is_empty()
    }
}

/// A parsed selector: comma groups of descendant chains of compounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    groups: Vec<Vec<Compound>>,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

impl Selector {
    /// Parse a selector such as `ul.menu li[data-id="3"], #main`
    pub fn parse(input: &str) -> HarnessResult<Self> {
        let invalid = || HarnessError::dom(format!("Invalid selector: {input}"));
        let chars: Vec<char> = input.chars().collect();
        let mut groups = Vec::new();
        let mut chain: Vec<Compound> = Vec::new();
        let mut current = Compound::default();
        let mut universal = false;
        let mut i = 0;

        let read_ident = |i: &mut usize| -> String {
            let start = *i;
            while *i < chars.len() && is_ident_char(chars[*i]) {
                *i += 1;
            }
            chars[start..*i].iter().collect()
        };

        while i < chars.len() {
            let c = chars[i];
            match c {
                ',' => {
                    if !current.is_empty() || universal {
                        chain.push(std::mem::take(&mut current));
                    }
                    if chain.is_empty() {
                        return Err(invalid());
                    }
                    groups.push(std::mem::take(&mut chain));
                    universal = false;
                    i += 1;
                }
                c if c.is_whitespace() => {
                    if !current.is_empty() || universal {
                        chain.push(std::mem::take(&mut current));
                        universal = false;
                    }
                    i += 1;
                }
                '*' => {
                    universal = true;
                    i += 1;
                }
                '#' | '.' => {
                    i += 1;
                    let ident = read_ident(&mut i);
                    if ident.is_empty() {
                        return Err(invalid());
                    }
                    if c == '#' {
                        current.id = Some(ident);
                    } else {
                        current.classes.push(ident);
                    }
                }
                '[' => {
                    i += 1;
                    let name = read_ident(&mut i);
                    if name.is_empty() || i >= chars.len() {
                        return Err(invalid());
                    }
                    let value = if chars[i] == '=' {
                        i += 1;
                        let quote = chars.get(i).copied().filter(|q| *q == '"' || *q == '\'');
                        let value = if let Some(q) = quote {
                            i += 1;
                            let start = i;
                            while i < chars.len() && chars[i] != q {
                                i += 1;
                            }
                            if i >= chars.len() {
                                return Err(invalid());
                            }
                            let value: String = chars[start..i].iter().collect();
                            i += 1;
                            value
                        } else {
                            read_ident(&mut i)
                        };
                        Some(value)
                    } else {
                        None
                    };
                    if chars.get(i) != Some(&']') {
                        return Err(invalid());
                    }
                    i += 1;
                    current.attrs.push((name.to_ascii_lowercase(), value));
                }
                c if is_ident_char(c) => {
                    let tag = read_ident(&mut i);
                    current.tag = Some(tag.to_ascii_lowercase());
                }
                _ => return Err(invalid()),
            }
        }

        if !current.is_empty() || universal {
            chain.push(current);
        }
        if chain.is_empty() {
            return Err(invalid());
        }
        groups.push(chain);
        Ok(Self { groups })
    }
}

/// An element tree with `html` and `body` always present
pub struct Document {
    nodes: Vec<Node>,
    html: NodeId,
    body: NodeId,
    active: Option<NodeId>,
    listeners: Vec<(NodeId, &'static str, Handler)>,
    dispatched: Vec<DomEvent>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("nodes", &self.nodes.len())
            .field("active", &self.active)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Create an empty document
    #[must_use]
    pub fn new() -> Self {
        let mut doc = Self {
            nodes: Vec::new(),
            html: 0,
            body: 0,
            active: None,
            listeners: Vec::new(),
            dispatched: Vec::new(),
        };
        doc.html = doc.create_element("html");
        doc.body = doc.create_element("body");
        doc.append_child(doc.html, doc.body);
        doc
    }

    /// Parse well-formed markup.
    ///
    /// A top-level `html`/`body` maps onto the document's own elements; any
    /// other top-level content lands in the body.
    pub fn parse(markup: &str) -> HarnessResult<Self> {
        let mut doc = Self::new();
        let mut reader = Reader::from_str(markup);
        reader.trim_text(true);
        let mut stack = vec![doc.body];

        loop {
            let position = reader.buffer_position();
            let markup_error = |message: String| HarnessError::Markup { position, message };
            let event = reader.read_event().map_err(|e| markup_error(e.to_string()))?;
            match event {
                Event::Start(start) => {
                    let node = doc.open_element(&start, &stack, markup_error)?;
                    stack.push(node);
                }
                Event::Empty(start) => {
                    doc.open_element(&start, &stack, markup_error)?;
                }
                Event::End(_) => {
                    if stack.len() > 1 {
                        stack.pop();
                    }
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(|e| markup_error(e.to_string()))?;
                    let parent = stack.last().copied().unwrap_or(doc.body);
                    let node = doc.create_text(&text);
                    doc.append_child(parent, node);
                }
                Event::CData(data) => {
                    let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    let parent = stack.last().copied().unwrap_or(doc.body);
                    let node = doc.create_text(&text);
                    doc.append_child(parent, node);
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(doc)
    }

    fn open_element(
        &mut self,
        start: &BytesStart<'_>,
        stack: &[NodeId],
        markup_error: impl Fn(String) -> HarnessError,
    ) -> HarnessResult<NodeId> {
        let tag = String::from_utf8_lossy(start.name().as_ref()).to_ascii_lowercase();
        let parent = stack.last().copied().unwrap_or(self.body);

        let node = match tag.as_str() {
            "html" if stack.len() == 1 => self.html,
            "body" if parent == self.html || stack.len() == 1 => self.body,
            _ => {
                let node = self.create_element(&tag);
                self.append_child(parent, node);
                node
            }
        };

        for attr in start.attributes() {
            let attr = attr.map_err(|e| markup_error(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_ascii_lowercase();
            let value = attr
                .unescape_value()
                .map_err(|e| markup_error(e.to_string()))?
                .into_owned();
            match key.as_str() {
                "value" => self.nodes[node].value.clone_from(&value),
                "checked" => self.nodes[node].checked = true,
                _ => {}
            }
            self.set_attribute(node, &key, &value);
        }
        Ok(node)
    }

    /// The `html` element
    #[must_use]
    pub const fn html(&self) -> NodeId {
        self.html
    }

    /// The `body` element
    #[must_use]
    pub const fn body(&self) -> NodeId {
        self.body
    }

    /// Create a detached element
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.nodes.push(Node {
            data: NodeData::Element {
                tag: tag.to_ascii_lowercase(),
                attrs: Vec::new(),
            },
            parent: None,
            children: Vec::new(),
            value: String::new(),
            checked: false,
        });
        self.nodes.len() - 1
    }

    /// Create a detached text node
    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.nodes.push(Node {
            data: NodeData::Text(text.to_string()),
            parent: None,
            children: Vec::new(),
            value: String::new(),
            checked: false,
        });
        self.nodes.len() - 1
    }

    fn detach(&mut self, child: NodeId) {
        if let Some(parent) = self.nodes[child].parent.take() {
            self.nodes[parent].children.retain(|c| *c != child);
        }
    }

    /// Append `child` as the last child of `parent`
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    /// Insert `child` as the first child of `parent`
    pub fn prepend_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.insert(0, child);
    }

    /// Parent of a node
    #[must_use]
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node).and_then(|n| n.parent)
    }

    /// Children of a node
    #[must_use]
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes.get(node).map_or(&[], |n| n.children.as_slice())
    }

    /// Tag name of an element, `None` for text nodes
    #[must_use]
    pub fn tag(&self, node: NodeId) -> Option<&str> {
        match self.nodes.get(node).map(|n| &n.data) {
            Some(NodeData::Element { tag, .. }) => Some(tag),
            _ => None,
        }
    }

    /// Attribute value of an element
    #[must_use]
    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        match self.nodes.get(node).map(|n| &n.data) {
            Some(NodeData::Element { attrs, .. }) => attrs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    /// Whether an element carries an attribute
    #[must_use]
    pub fn has_attribute(&self, node: NodeId, name: &str) -> bool {
        self.attribute(node, name).is_some()
    }

    /// Set an attribute on an element; ignored for text nodes
    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        if let Some(NodeData::Element { attrs, .. }) = self.nodes.get_mut(node).map(|n| &mut n.data)
        {
            match attrs.iter_mut().find(|(k, _)| k == name) {
                Some((_, v)) => *v = value.to_string(),
                None => attrs.push((name.to_string(), value.to_string())),
            }
        }
    }

    /// Concatenated text of a node and its descendants
    #[must_use]
    pub fn text_content(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(node, &mut out);
        out
    }

    fn collect_text(&self, node: NodeId, out: &mut String) {
        match &self.nodes[node].data {
            NodeData::Text(text) => out.push_str(text),
            NodeData::Element { .. } => {
                for child in &self.nodes[node].children {
                    self.collect_text(*child, out);
                }
            }
        }
    }

    /// Replace the children of `node` with a single text node
    pub fn set_text(&mut self, node: NodeId, text: &str) {
        if let NodeData::Text(existing) = &mut self.nodes[node].data {
            *existing = text.to_string();
            return;
        }
        for child in std::mem::take(&mut self.nodes[node].children) {
            self.nodes[child].parent = None;
        }
        let text = self.create_text(text);
        self.append_child(node, text);
    }

    /// Class list of an element
    #[must_use]
    pub fn classes(&self, node: NodeId) -> Vec<&str> {
        self.attribute(node, "class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// Whether an element has a class
    #[must_use]
    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.classes(node).contains(&class)
    }

    /// Add a class if missing
    pub fn add_class(&mut self, node: NodeId, class: &str) {
        if self.has_class(node, class) {
            return;
        }
        let mut classes: Vec<String> = self.classes(node).into_iter().map(String::from).collect();
        classes.push(class.to_string());
        self.set_attribute(node, "class", &classes.join(" "));
    }

    /// Remove a class if present
    pub fn remove_class(&mut self, node: NodeId, class: &str) {
        if !self.has_class(node, class) {
            return;
        }
        let classes: Vec<String> = self
            .classes(node)
            .into_iter()
            .filter(|c| *c != class)
            .map(String::from)
            .collect();
        self.set_attribute(node, "class", &classes.join(" "));
    }

    /// Current form value of a node
    #[must_use]
    pub fn value(&self, node: NodeId) -> &str {
        &self.nodes[node].value
    }

    /// Current checked state of a node
    #[must_use]
    pub fn is_checked(&self, node: NodeId) -> bool {
        self.nodes[node].checked
    }

    /// Focused element
    #[must_use]
    pub const fn active_element(&self) -> Option<NodeId> {
        self.active
    }

    /// Value of an inline style property
    #[must_use]
    pub fn style(&self, node: NodeId, property: &str) -> Option<String> {
        self.attribute(node, "style")?.split(';').find_map(|decl| {
            let (name, value) = decl.split_once(':')?;
            (name.trim().eq_ignore_ascii_case(property)).then(|| value.trim().to_ascii_lowercase())
        })
    }

    /// Recently dispatched events, oldest first, at most
    /// [`DISPATCH_LOG_LIMIT`]
    #[must_use]
    pub fn dispatched_events(&self) -> &[DomEvent] {
        &self.dispatched
    }

    /// Forget the dispatch log
    pub fn clear_dispatched(&mut self) {
        self.dispatched.clear();
    }

    fn record(&mut self, event: DomEvent) {
        if self.dispatched.len() >= DISPATCH_LOG_LIMIT {
            self.dispatched.remove(0);
        }
        self.dispatched.push(event);
    }

    /// Attached nodes in document order
    fn document_order(&self) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![self.html];
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(self.nodes[node].children.iter().rev());
        }
        order
    }

    /// First element in document order with the given id
    #[must_use]
    pub fn element_by_id(&self, id: &str) -> Option<NodeId> {
        self.document_order()
            .into_iter()
            .find(|n| self.attribute(*n, "id") == Some(id))
    }

    /// Elements matching `selector`, in document order
    pub fn query_all(&self, selector: &str) -> HarnessResult<Vec<NodeId>> {
        let selector = Selector::parse(selector)?;
        Ok(self
            .document_order()
            .into_iter()
            .filter(|n| self.matches(*n, &selector))
            .collect())
    }

    fn matches(&self, node: NodeId, selector: &Selector) -> bool {
        selector.groups.iter().any(|chain| self.matches_chain(node, chain))
    }

    fn matches_chain(&self, node: NodeId, chain: &[Compound]) -> bool {
        let Some((last, ancestors)) = chain.split_last() else {
            return false;
        };
        if !self.matches_compound(node, last) {
            return false;
        }
        let mut cursor = self.parent(node);
        for compound in ancestors.iter().rev() {
            loop {
                match cursor {
                    Some(ancestor) if self.matches_compound(ancestor, compound) => {
                        cursor = self.parent(ancestor);
                        break;
                    }
                    Some(ancestor) => cursor = self.parent(ancestor),
                    None => return false,
                }
            }
        }
        true
    }

    fn matches_compound(&self, node: NodeId, compound: &Compound) -> bool {
        let Some(tag) = self.tag(node) else {
            return false;
        };
        if compound.tag.as_deref().is_some_and(|t| t != tag) {
            return false;
        }
        if compound
            .id
            .as_deref()
            .is_some_and(|id| self.attribute(node, "id") != Some(id))
        {
            return false;
        }
        if !compound.classes.iter().all(|c| self.has_class(node, c)) {
            return false;
        }
        compound.attrs.iter().all(|(name, value)| match value {
            Some(expected) => self.attribute(node, name) == Some(expected.as_str()),
            None => self.has_attribute(node, name),
        })
    }
}

/// Shared handle to a context's document, given to setup and logic code
#[derive(Clone)]
pub struct Doc {
    inner: Arc<Mutex<Document>>,
}

impl fmt::Debug for Doc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Doc").field(&*self.lock()).finish()
    }
}

impl Doc {
    /// Wrap a document
    #[must_use]
    pub fn new(document: Document) -> Self {
        Self {
            inner: Arc::new(Mutex::new(document)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Document> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the underlying document
    pub fn with<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.lock())
    }

    /// Mutate the underlying document
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Document) -> R) -> R {
        f(&mut self.lock())
    }

    fn elem(&self, node: NodeId) -> Elem {
        Elem {
            doc: self.clone(),
            node,
        }
    }

    /// Run a selector query
    pub fn query(&self, selector: &str) -> HarnessResult<QueryResult> {
        let nodes = self.lock().query_all(selector)?;
        Ok(QueryResult {
            elems: nodes.into_iter().map(|n| self.elem(n)).collect(),
        })
    }

    /// Pull an element by id
    pub fn by_id(&self, id: &str) -> HarnessResult<Elem> {
        let node = self.lock().element_by_id(id);
        node.map(|n| self.elem(n))
            .ok_or_else(|| HarnessError::dom(format!("Could not find element with id {id}")))
    }

    /// The document body
    #[must_use]
    pub fn body(&self) -> Elem {
        let body = self.lock().body();
        self.elem(body)
    }

    /// The root `html` element
    #[must_use]
    pub fn html(&self) -> Elem {
        let html = self.lock().html();
        self.elem(html)
    }

    fn dispatch(&self, event: DomEvent) {
        let handlers: Vec<Handler> = {
            let mut doc = self.lock();
            doc.record(event);
            let mut path = vec![event.target];
            if event.kind.bubbles() {
                let mut cursor = doc.parent(event.target);
                while let Some(node) = cursor {
                    path.push(node);
                    cursor = doc.parent(node);
                }
            }
            let name = event.kind.name();
            let mut handlers = Vec::new();
            for node in &path {
                for (listener_node, listener_event, handler) in &doc.listeners {
                    if listener_node == node && *listener_event == name {
                        handlers.push(Arc::clone(handler));
                    }
                }
            }
            handlers
        };

        // Listeners run unlocked so they can use the document themselves.
        let target = self.elem(event.target);
        for handler in handlers {
            handler(&target, &event);
        }
    }
}

/// The results of a query
#[derive(Debug, Clone)]
pub struct QueryResult {
    elems: Vec<Elem>,
}

impl QueryResult {
    /// Number of matches
    #[must_use]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// Whether nothing matched
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// Assert a single result and return it
    pub fn one(&self) -> HarnessResult<Elem> {
        if self.elems.len() != 1 {
            return Err(HarnessError::dom(format!(
                "Expected only one result, but found {}",
                self.elems.len()
            )));
        }
        Ok(self.elems[0].clone())
    }

    /// Assert at least one result and return the first
    pub fn first(&self) -> HarnessResult<Elem> {
        self.elems
            .first()
            .cloned()
            .ok_or_else(|| HarnessError::dom("Expected at least one result, but found none"))
    }

    /// Apply a callback to each element
    pub fn for_each(&self, mut f: impl FnMut(&Elem)) {
        for elem in &self.elems {
            f(elem);
        }
    }

    /// Iterate the matches
    pub fn iter(&self) -> std::slice::Iter<'_, Elem> {
        self.elems.iter()
    }
}

/// A single element of a [`Doc`]
#[derive(Clone)]
pub struct Elem {
    doc: Doc,
    node: NodeId,
}

impl fmt::Debug for Elem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Elem").field("node", &self.node).finish()
    }
}

impl Elem {
    /// Node index inside the document
    #[must_use]
    pub const fn node(&self) -> NodeId {
        self.node
    }

    fn as_element(&self) -> HarnessResult<()> {
        if self.doc.lock().tag(self.node).is_some() {
            Ok(())
        } else {
            Err(HarnessError::dom("Element is not a HTMLElement"))
        }
    }

    fn as_input(&self) -> HarnessResult<()> {
        if self.doc.lock().tag(self.node) == Some("input") {
            Ok(())
        } else {
            Err(HarnessError::dom("Element is not a HTMLInputElement"))
        }
    }

    /// Text content
    #[must_use]
    pub fn text(&self) -> String {
        self.doc.lock().text_content(self.node)
    }

    /// Replace the text content
    pub fn set_text(&self, text: &str) {
        self.doc.lock().set_text(self.node, text);
    }

    /// Attribute value
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<String> {
        self.doc.lock().attribute(self.node, name).map(String::from)
    }

    /// Whether the element has a class
    pub fn has_class(&self, class: &str) -> HarnessResult<bool> {
        self.as_element()?;
        Ok(self.doc.lock().has_class(self.node, class))
    }

    /// Add a class
    pub fn add_class(&self, class: &str) -> HarnessResult<()> {
        self.as_element()?;
        self.doc.lock().add_class(self.node, class);
        Ok(())
    }

    /// Remove a class
    pub fn remove_class(&self, class: &str) -> HarnessResult<()> {
        self.as_element()?;
        self.doc.lock().remove_class(self.node, class);
        Ok(())
    }

    /// Trigger a click event
    pub fn click(&self) -> HarnessResult<()> {
        self.as_element()?;
        self.doc.dispatch(DomEvent {
            kind: EventKind::Click,
            target: self.node,
        });
        Ok(())
    }

    /// Trigger a `keyup` event
    pub fn key_up(&self, code: u32, mods: KeyModifiers) -> HarnessResult<()> {
        self.as_element()?;
        self.doc.dispatch(DomEvent {
            kind: EventKind::KeyUp { code, mods },
            target: self.node,
        });
        Ok(())
    }

    /// Trigger a `keydown` event
    pub fn key_down(&self, code: u32, mods: KeyModifiers) -> HarnessResult<()> {
        self.as_element()?;
        self.doc.dispatch(DomEvent {
            kind: EventKind::KeyDown { code, mods },
            target: self.node,
        });
        Ok(())
    }

    /// Simulate typing into a field
    pub fn type_into(&self, value: &str) -> HarnessResult<()> {
        self.as_input()?;
        self.doc.lock().nodes[self.node].value = value.to_string();
        self.doc.dispatch(DomEvent {
            kind: EventKind::Input,
            target: self.node,
        });
        Ok(())
    }

    /// Change the state of a checkbox
    pub fn set_checkbox(&self, checked: bool) -> HarnessResult<()> {
        self.as_input()?;
        self.doc.lock().nodes[self.node].checked = checked;
        self.doc.dispatch(DomEvent {
            kind: EventKind::Change,
            target: self.node,
        });
        Ok(())
    }

    /// Current field value
    #[must_use]
    pub fn value(&self) -> String {
        self.doc.lock().value(self.node).to_string()
    }

    /// Current checkbox state
    #[must_use]
    pub fn is_checked(&self) -> bool {
        self.doc.lock().is_checked(self.node)
    }

    /// Give this element focus
    pub fn focus(&self) -> HarnessResult<()> {
        self.as_element()?;
        self.doc.lock().active = Some(self.node);
        self.doc.dispatch(DomEvent {
            kind: EventKind::Focus,
            target: self.node,
        });
        Ok(())
    }

    /// Whether this element has focus
    #[must_use]
    pub fn is_focused(&self) -> bool {
        self.doc.lock().active_element() == Some(self.node)
    }

    /// Whether the element is displayed (`display` is not `none`)
    pub fn is_visible(&self) -> HarnessResult<bool> {
        self.as_element()?;
        Ok(self.doc.lock().style(self.node, "display").as_deref() != Some("none"))
    }

    /// Listen for events of type `event` on this element or, for bubbling
    /// events, its descendants
    pub fn on(
        &self,
        event: &'static str,
        handler: impl Fn(&Self, &DomEvent) + Send + Sync + 'static,
    ) {
        let handler: Handler = Arc::new(handler);
        self.doc.lock().listeners.push((self.node, event, handler));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FIXTURE: &str = r#"
        <div id="app" class="shell">
            <ul class="menu">
                <li data-id="1">One</li>
                <li data-id="2" class="active">Two</li>
            </ul>
            <input id="name" type="text" value="abc"/>
            <input id="agree" type="checkbox"/>
            <p id="hidden" style="color: red; display: none">Secret</p>
            <button id="go">Go</button>
        </div>
    "#;

    fn doc() -> Doc {
        Doc::new(Document::parse(FIXTURE).unwrap())
    }

    // =========================================================================
    // Parsing and queries
    // =========================================================================

    #[test]
    fn test_fragment_lands_in_body() {
        let doc = doc();
        let app = doc.by_id("app").unwrap();
        let parent = doc.with(|d| d.parent(app.node()));
        assert_eq!(parent, Some(doc.body().node()));
    }

    #[test]
    fn test_full_document_maps_html_and_body() {
        let document =
            Document::parse("<html><head></head><body class=\"x\"><p>hi</p></body></html>")
                .unwrap();
        assert!(document.has_class(document.body(), "x"));
        assert_eq!(document.text_content(document.body()), "hi");
    }

    #[test]
    fn test_malformed_markup() {
        let err = Document::parse("<div><span></div>").unwrap_err();
        assert!(matches!(err, HarnessError::Markup { .. }));
    }

    #[test]
    fn test_selectors() {
        let doc = doc();
        assert_eq!(doc.query("li").unwrap().len(), 2);
        assert_eq!(doc.query("ul.menu li.active").unwrap().len(), 1);
        assert_eq!(doc.query("[data-id=\"2\"]").unwrap().one().unwrap().text(), "Two");
        assert_eq!(doc.query("[data-id]").unwrap().len(), 2);
        assert_eq!(doc.query("#go, #name").unwrap().len(), 2);
        assert_eq!(doc.query(".shell *").unwrap().len(), 7);
        assert!(doc.query("section li").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_selector() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("li[").is_err());
        assert!(Selector::parse("a,,b").is_err());
        assert!(Selector::parse("[x='unterminated]").is_err());
    }

    #[test]
    fn test_query_one_and_first_errors() {
        let doc = doc();
        let err = doc.query("li").unwrap().one().unwrap_err();
        assert_eq!(err.to_string(), "Expected only one result, but found 2");
        let err = doc.query("table").unwrap().first().unwrap_err();
        assert_eq!(err.to_string(), "Expected at least one result, but found none");
        assert_eq!(doc.query("li").unwrap().first().unwrap().text(), "One");
    }

    #[test]
    fn test_by_id_missing() {
        let err = doc().by_id("nope").unwrap_err();
        assert_eq!(err.to_string(), "Could not find element with id nope");
    }

    #[test]
    fn test_for_each_visits_in_order() {
        let mut texts = Vec::new();
        doc().query("li").unwrap().for_each(|e| texts.push(e.text()));
        assert_eq!(texts, vec!["One", "Two"]);
    }

    // =========================================================================
    // Element operations
    // =========================================================================

    #[test]
    fn test_classes() {
        let doc = doc();
        let two = doc.query("li.active").unwrap().one().unwrap();
        assert!(two.has_class("active").unwrap());
        two.remove_class("active").unwrap();
        assert!(!two.has_class("active").unwrap());
        two.add_class("done").unwrap();
        two.add_class("done").unwrap();
        assert_eq!(two.attribute("class").as_deref(), Some("done"));
    }

    #[test]
    fn test_type_into_requires_input() {
        let doc = doc();
        let name = doc.by_id("name").unwrap();
        assert_eq!(name.value(), "abc");
        name.type_into("xyz").unwrap();
        assert_eq!(name.value(), "xyz");

        let err = doc.by_id("go").unwrap().type_into("x").unwrap_err();
        assert_eq!(err.to_string(), "Element is not a HTMLInputElement");
    }

    #[test]
    fn test_set_checkbox() {
        let doc = doc();
        let agree = doc.by_id("agree").unwrap();
        assert!(!agree.is_checked());
        agree.set_checkbox(true).unwrap();
        assert!(agree.is_checked());
        assert!(doc.by_id("app").unwrap().set_checkbox(true).is_err());
    }

    #[test]
    fn test_focus() {
        let doc = doc();
        let go = doc.by_id("go").unwrap();
        let name = doc.by_id("name").unwrap();
        go.focus().unwrap();
        assert!(go.is_focused());
        name.focus().unwrap();
        assert!(!go.is_focused());
        assert!(name.is_focused());
    }

    #[test]
    fn test_visibility() {
        let doc = doc();
        assert!(!doc.by_id("hidden").unwrap().is_visible().unwrap());
        assert!(doc.by_id("go").unwrap().is_visible().unwrap());
    }

    // =========================================================================
    // Events
    // =========================================================================

    #[test]
    fn test_click_bubbles_to_ancestor_listener() {
        let doc = doc();
        let clicks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&clicks);
        doc.by_id("app").unwrap().on("click", move |target, _| {
            assert_eq!(target.text(), "Go");
            seen.fetch_add(1, Ordering::SeqCst);
        });
        doc.by_id("go").unwrap().click().unwrap();
        assert_eq!(clicks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_mutate_document() {
        let doc = doc();
        doc.by_id("go").unwrap().on("click", |target, _| {
            target.set_text("Gone");
        });
        let go = doc.by_id("go").unwrap();
        go.click().unwrap();
        assert_eq!(go.text(), "Gone");
    }

    #[test]
    fn test_change_does_not_bubble() {
        let doc = doc();
        let changes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&changes);
        doc.by_id("app").unwrap().on("change", move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        doc.by_id("agree").unwrap().set_checkbox(true).unwrap();
        assert_eq!(changes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_key_events_carry_modifiers() {
        let doc = doc();
        let name = doc.by_id("name").unwrap();
        name.key_down(13, KeyModifiers::none().shift()).unwrap();
        name.key_up(13, KeyModifiers::default()).unwrap();
        let events = doc.with(|d| d.dispatched_events().to_vec());
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].kind,
            EventKind::KeyDown {
                code: 13,
                mods: KeyModifiers::none().shift()
            }
        );
        assert_eq!(events[1].kind.name(), "keyup");
    }

    #[test]
    fn test_dispatch_log_is_bounded_and_clearable() {
        let doc = doc();
        let go = doc.by_id("go").unwrap();
        for _ in 0..DISPATCH_LOG_LIMIT + 10 {
            go.click().unwrap();
        }
        go.focus().unwrap();
        let (len, last) = doc.with(|d| {
            (
                d.dispatched_events().len(),
                d.dispatched_events().last().map(|e| e.kind),
            )
        });
        assert_eq!(len, DISPATCH_LOG_LIMIT);
        assert_eq!(last, Some(EventKind::Focus));

        doc.with_mut(Document::clear_dispatched);
        assert!(doc.with(|d| d.dispatched_events().is_empty()));
    }
}
