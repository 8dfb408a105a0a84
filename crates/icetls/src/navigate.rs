use crate::error::{Error, Result};
use crate::xmltree::{Element, XmlNode};

// Configuration trees are small and shallow; a linear scan over the child
// list is the whole algorithm.
pub fn find_child<'a>(parent: &'a Element, tag: &str) -> Option<&'a Element> {
    parent.children.iter().find_map(|node| match node {
        XmlNode::Element(el) if el.name() == tag => Some(el),
        _ => None,
    })
}

pub fn find_child_mut<'a>(parent: &'a mut Element, tag: &str) -> Option<&'a mut Element> {
    parent.children.iter_mut().find_map(|node| match node {
        XmlNode::Element(el) if el.name() == tag => Some(el),
        _ => None,
    })
}

// Resolves a dotted path of element names. Fails on the first missing
// segment; never creates anything along the way.
pub fn resolve_path<'a>(root: &'a Element, path: &[&str]) -> Result<&'a Element> {
    let mut node = root;
    for name in path {
        node = find_child(node, name).ok_or_else(|| Error::PathNotFound(path.join(".")))?;
    }
    Ok(node)
}

pub fn resolve_path_mut<'a>(root: &'a mut Element, path: &[&str]) -> Result<&'a mut Element> {
    let mut node = root;
    for name in path {
        node = find_child_mut(node, name).ok_or_else(|| Error::PathNotFound(path.join(".")))?;
    }
    Ok(node)
}
