//! Active-session registry.
//!
//! A doubly linked list over slab storage, keyed by frontend domain id.
//! Expected cardinality is tens of sessions; lookup walks the links.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use slab::Slab;

use crate::{
    grant::{GrantRef, MAX_DIR_PAGES},
    platform::DomainId,
};

/// Grants and bookkeeping for one attached frontend.
pub struct Session {
    pub frontend: DomainId,
    /// One read-only grant per weight page, in page order.
    pub grants: Vec<GrantRef>,
    /// One grant per directory page, in page order.
    pub directory: ArrayVec<GrantRef, MAX_DIR_PAGES>,
}

struct Node {
    session: Session,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly linked collection of active sessions.
pub struct SessionRegistry {
    nodes: Slab<Node>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            nodes: Slab::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Appends `session` at the tail.
    pub fn push(&mut self, session: Session) {
        let key = self.nodes.insert(Node {
            session,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
    }

    fn find(&self, frontend: DomainId) -> Option<usize> {
        let mut cursor = self.head;
        while let Some(key) = cursor {
            let node = &self.nodes[key];
            if node.session.frontend == frontend {
                return Some(key);
            }
            cursor = node.next;
        }
        None
    }

    pub fn contains(&self, frontend: DomainId) -> bool {
        self.find(frontend).is_some()
    }

    pub fn get(&self, frontend: DomainId) -> Option<&Session> {
        self.find(frontend).map(|key| &self.nodes[key].session)
    }

    /// Unlinks and returns the session for `frontend`, if any.
    pub fn remove(&mut self, frontend: DomainId) -> Option<Session> {
        let key = self.find(frontend)?;
        let node = self.nodes.remove(key);
        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.tail = node.prev,
        }
        Some(node.session)
    }

    /// Unlinks and returns the oldest session, if any.
    pub fn pop(&mut self) -> Option<Session> {
        let frontend = self.nodes[self.head?].session.frontend;
        self.remove(frontend)
    }

    /// Iterates sessions in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        Iter {
            registry: self,
            cursor: self.head,
        }
    }
}

struct Iter<'a> {
    registry: &'a SessionRegistry,
    cursor: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Session;

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.cursor?;
        let node = &self.registry.nodes[key];
        self.cursor = node.next;
        Some(&node.session)
    }
}
