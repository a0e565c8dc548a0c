//! HTML querying for guest code
//!
//! Guest plugins parse fetched HTML with `htmlQuery(html)` (also exposed as
//! `cheerio.load`). Documents are parsed and queried host-side; the guest
//! only ever holds opaque selection handles, and every query op is
//! synchronous, so `each`/`map` callbacks re-enter the engine inline without
//! leaving the dedicated execution context.
//!
//! Selection handles are scoped to one top-level operation; the registry is
//! cleared when the next operation starts.

use std::collections::HashMap;

use anyhow::{anyhow, bail};
use deno_core::{op2, OpState};
use scraper::{ElementRef, Html, Selector};

type NodeId = ego_tree::NodeId;

/// One set of matched elements within a parsed document.
struct Selection {
    doc: u32,
    nodes: Vec<NodeId>,
}

/// Host-side store of parsed documents and selections, owned by the engine
/// thread through `OpState`.
#[derive(Default)]
pub(crate) struct DomRegistry {
    docs: HashMap<u32, Html>,
    sels: HashMap<u32, Selection>,
    next_doc: u32,
    next_sel: u32,
}

impl DomRegistry {
    /// Parse an HTML string and return a selection holding its root element.
    pub(crate) fn parse(&mut self, html: &str) -> u32 {
        let doc = Html::parse_document(html);
        let root = doc.root_element().id();
        let doc_id = self.next_doc;
        self.next_doc += 1;
        self.docs.insert(doc_id, doc);
        self.insert_selection(doc_id, vec![root])
    }

    /// Run a CSS selector over a selection. Matches the nodes themselves and
    /// their descendants, in document order, deduplicated.
    pub(crate) fn select(&mut self, sel_id: u32, selector: &str) -> anyhow::Result<u32> {
        let selector = Selector::parse(selector)
            .map_err(|e| anyhow!("invalid selector {selector:?}: {e}"))?;
        let (doc_id, source_nodes) = self.selection_nodes(sel_id)?;
        let doc = self.doc(doc_id)?;

        let mut nodes: Vec<NodeId> = Vec::new();
        for node_id in source_nodes {
            let Some(element) = element(doc, node_id) else {
                continue;
            };
            if selector.matches(&element) && !nodes.contains(&node_id) {
                nodes.push(node_id);
            }
            for found in element.select(&selector) {
                if !nodes.contains(&found.id()) {
                    nodes.push(found.id());
                }
            }
        }
        Ok(self.insert_selection(doc_id, nodes))
    }

    /// Concatenated text of every matched element.
    pub(crate) fn text(&self, sel_id: u32) -> anyhow::Result<String> {
        let (doc_id, nodes) = self.selection_nodes(sel_id)?;
        let doc = self.doc(doc_id)?;
        let mut out = String::new();
        for node_id in nodes {
            if let Some(element) = element(doc, node_id) {
                for piece in element.text() {
                    out.push_str(piece);
                }
            }
        }
        Ok(out)
    }

    /// Inner HTML of the first matched element.
    pub(crate) fn inner_html(&self, sel_id: u32) -> anyhow::Result<Option<String>> {
        Ok(self.first_element(sel_id)?.map(|el| el.inner_html()))
    }

    /// Outer HTML of the first matched element.
    pub(crate) fn outer_html(&self, sel_id: u32) -> anyhow::Result<Option<String>> {
        Ok(self.first_element(sel_id)?.map(|el| el.html()))
    }

    /// Attribute value from the first matched element.
    pub(crate) fn attr(&self, sel_id: u32, name: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .first_element(sel_id)?
            .and_then(|el| el.value().attr(name).map(str::to_string)))
    }

    pub(crate) fn len(&self, sel_id: u32) -> anyhow::Result<u32> {
        let (_, nodes) = self.selection_nodes(sel_id)?;
        Ok(nodes.len() as u32)
    }

    /// Reduce a selection to the element at `index`; negative indexes count
    /// from the end, out-of-range yields an empty selection.
    pub(crate) fn eq(&mut self, sel_id: u32, index: i32) -> anyhow::Result<u32> {
        let (doc_id, nodes) = self.selection_nodes(sel_id)?;
        let len = nodes.len() as i64;
        let resolved = if index < 0 {
            len + i64::from(index)
        } else {
            i64::from(index)
        };
        let picked = if (0..len).contains(&resolved) {
            vec![nodes[resolved as usize]]
        } else {
            Vec::new()
        };
        Ok(self.insert_selection(doc_id, picked))
    }

    /// Structural traversal applied to each matched element.
    pub(crate) fn traverse(&mut self, sel_id: u32, axis: &str) -> anyhow::Result<u32> {
        let (doc_id, source_nodes) = self.selection_nodes(sel_id)?;
        let doc = self.doc(doc_id)?;

        let mut nodes: Vec<NodeId> = Vec::new();
        let mut push = |id: NodeId| {
            if !nodes.contains(&id) {
                nodes.push(id);
            }
        };
        for node_id in source_nodes {
            let Some(el) = element(doc, node_id) else {
                continue;
            };
            match axis {
                "next" => {
                    if let Some(next) = el.next_siblings().find_map(ElementRef::wrap) {
                        push(next.id());
                    }
                }
                "prev" => {
                    if let Some(prev) = el.prev_siblings().find_map(ElementRef::wrap) {
                        push(prev.id());
                    }
                }
                "parent" => {
                    if let Some(parent) = el.parent().and_then(ElementRef::wrap) {
                        push(parent.id());
                    }
                }
                "children" => {
                    for child in el.children().filter_map(ElementRef::wrap) {
                        push(child.id());
                    }
                }
                "siblings" => {
                    if let Some(parent) = el.parent() {
                        for sibling in parent.children().filter_map(ElementRef::wrap) {
                            if sibling.id() != node_id {
                                push(sibling.id());
                            }
                        }
                    }
                }
                other => bail!("unknown traversal axis {other:?}"),
            }
        }
        Ok(self.insert_selection(doc_id, nodes))
    }

    /// Drop every document and selection. Stale guest handles error afterwards.
    pub(crate) fn clear(&mut self) {
        self.docs.clear();
        self.sels.clear();
    }

    fn insert_selection(&mut self, doc: u32, nodes: Vec<NodeId>) -> u32 {
        let sel_id = self.next_sel;
        self.next_sel += 1;
        self.sels.insert(sel_id, Selection { doc, nodes });
        sel_id
    }

    fn selection_nodes(&self, sel_id: u32) -> anyhow::Result<(u32, Vec<NodeId>)> {
        let sel = self
            .sels
            .get(&sel_id)
            .ok_or_else(|| anyhow!("unknown selection handle {sel_id}"))?;
        Ok((sel.doc, sel.nodes.clone()))
    }

    fn doc(&self, doc_id: u32) -> anyhow::Result<&Html> {
        self.docs
            .get(&doc_id)
            .ok_or_else(|| anyhow!("unknown document handle {doc_id}"))
    }

    fn first_element(&self, sel_id: u32) -> anyhow::Result<Option<ElementRef<'_>>> {
        let (doc_id, nodes) = self.selection_nodes(sel_id)?;
        let doc = self.doc(doc_id)?;
        Ok(nodes.first().and_then(|&id| element(doc, id)))
    }
}

fn element(doc: &Html, id: NodeId) -> Option<ElementRef<'_>> {
    ElementRef::wrap(doc.tree.get(id)?)
}

#[op2(fast)]
pub fn op_html_parse(state: &mut OpState, #[string] html: String) -> u32 {
    state.borrow_mut::<DomRegistry>().parse(&html)
}

#[op2(fast)]
pub fn op_html_select(
    state: &mut OpState,
    sel: u32,
    #[string] selector: String,
) -> Result<u32, anyhow::Error> {
    state.borrow_mut::<DomRegistry>().select(sel, &selector)
}

#[op2]
#[string]
pub fn op_html_text(state: &mut OpState, sel: u32) -> Result<String, anyhow::Error> {
    state.borrow::<DomRegistry>().text(sel)
}

#[op2]
#[string]
pub fn op_html_inner_html(state: &mut OpState, sel: u32) -> Result<Option<String>, anyhow::Error> {
    state.borrow::<DomRegistry>().inner_html(sel)
}

#[op2]
#[string]
pub fn op_html_outer_html(state: &mut OpState, sel: u32) -> Result<Option<String>, anyhow::Error> {
    state.borrow::<DomRegistry>().outer_html(sel)
}

#[op2]
#[string]
pub fn op_html_attr(
    state: &mut OpState,
    sel: u32,
    #[string] name: String,
) -> Result<Option<String>, anyhow::Error> {
    state.borrow::<DomRegistry>().attr(sel, &name)
}

#[op2(fast)]
pub fn op_html_length(state: &mut OpState, sel: u32) -> Result<u32, anyhow::Error> {
    state.borrow::<DomRegistry>().len(sel)
}

#[op2(fast)]
pub fn op_html_eq(state: &mut OpState, sel: u32, index: i32) -> Result<u32, anyhow::Error> {
    state.borrow_mut::<DomRegistry>().eq(sel, index)
}

#[op2(fast)]
pub fn op_html_traverse(
    state: &mut OpState,
    sel: u32,
    #[string] axis: String,
) -> Result<u32, anyhow::Error> {
    state.borrow_mut::<DomRegistry>().traverse(sel, &axis)
}

/// Guest-side chainable wrapper over the query ops, installed before any
/// plugin code runs.
pub(crate) const QUERY_PRELUDE: &str = r#"
"use strict";
(function() {
  const ops = Deno.core.ops;

  function makeQuery(id) {
    const q = {
      find: (selector) => makeQuery(ops.op_html_select(id, String(selector))),
      text: () => ops.op_html_text(id),
      html: () => {
        const v = ops.op_html_inner_html(id);
        return v === null ? undefined : v;
      },
      outerHtml: () => {
        const v = ops.op_html_outer_html(id);
        return v === null ? undefined : v;
      },
      attr: (name) => {
        const v = ops.op_html_attr(id, String(name));
        return v === null ? undefined : v;
      },
      first: () => makeQuery(ops.op_html_eq(id, 0)),
      last: () => makeQuery(ops.op_html_eq(id, -1)),
      eq: (i) => makeQuery(ops.op_html_eq(id, i | 0)),
      next: () => makeQuery(ops.op_html_traverse(id, 'next')),
      prev: () => makeQuery(ops.op_html_traverse(id, 'prev')),
      parent: () => makeQuery(ops.op_html_traverse(id, 'parent')),
      children: () => makeQuery(ops.op_html_traverse(id, 'children')),
      siblings: () => makeQuery(ops.op_html_traverse(id, 'siblings')),
      each: function(callback) {
        const len = ops.op_html_length(id);
        for (let i = 0; i < len; i++) {
          if (callback.call(q, i, q.eq(i)) === false) break;
        }
        return q;
      },
      map: function(callback) {
        const out = [];
        const len = ops.op_html_length(id);
        for (let i = 0; i < len; i++) {
          out.push(callback.call(q, i, q.eq(i)));
        }
        return { get: () => out, toArray: () => out };
      },
      toArray: function() {
        const out = [];
        const len = ops.op_html_length(id);
        for (let i = 0; i < len; i++) out.push(q.eq(i));
        return out;
      },
      get: function(i) {
        return i === undefined ? q.toArray() : q.eq(i | 0);
      },
    };
    Object.defineProperty(q, 'length', {
      get: () => ops.op_html_length(id),
    });
    return q;
  }

  globalThis.htmlQuery = function(html) {
    const rootId = ops.op_html_parse(String(html));
    const dollar = function(target) {
      if (typeof target === 'string') {
        return makeQuery(ops.op_html_select(rootId, target));
      }
      return target;
    };
    const root = makeQuery(rootId);
    for (const key of Object.keys(root)) {
      dollar[key] = root[key];
    }
    Object.defineProperty(dollar, 'length', {
      get: () => ops.op_html_length(rootId),
    });
    return dollar;
  };

  globalThis.cheerio = { load: globalThis.htmlQuery };
})();
"#;
