//! Handler dispatch.
//!
//! Handlers are registered under a token-sequence pattern; an incoming
//! request selects the handler whose pattern is the longest matching
//! prefix of its tokens, and the remaining tokens become the arguments.
//! The table is generic over a context type so the broker and the client
//! register different handler sets against the same machinery.

use tracing::trace;

use crate::grammar::normalize;

/// What the caller should do after a handler ran.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Handled; nothing further to send.
    Done,
    /// No handler claimed the request, or the handler declined it.
    Unhandled,
    /// Deliver these payloads back to the requester, in order.
    Reply(Vec<String>),
    /// Local command sentinel: the caller prints its own state.
    Dump,
}

/// Where a request came from, as seen by a handler.
#[derive(Debug, Clone)]
pub struct RequestEnv {
    /// Mailslot id of the peer that rang.
    pub requester_id: u64,
    /// Its nodename as read from the mailslot.
    pub requester_name: String,
    /// Diagnostic tracker value, if the payload carried one.
    pub tracker: Option<u64>,
}

/// A registered handler: context, request environment, remaining tokens.
pub type Handler<C> = fn(&mut C, &RequestEnv, &[&str]) -> Outcome;

/// Longest-prefix-match dispatch table.
pub struct HandlerTable<C> {
    entries: Vec<(Vec<String>, Handler<C>)>,
}

impl<C> HandlerTable<C> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register `handler` under a space-separated pattern such as
    /// `"Link CTL Peer-Attribute"`.
    pub fn register(&mut self, pattern: &str, handler: Handler<C>) {
        let pattern: Vec<String> = pattern.split_whitespace().map(normalize).collect();
        self.entries.push((pattern, handler));
    }

    /// Find and invoke the handler with the longest matching prefix.
    pub fn dispatch(&self, ctx: &mut C, env: &RequestEnv, tokens: &[&str]) -> Outcome {
        let normalized: Vec<String> = tokens.iter().map(|t| normalize(t)).collect();

        let mut best: Option<&(Vec<String>, Handler<C>)> = None;
        for entry in &self.entries {
            let (pattern, _) = entry;
            if pattern.len() > normalized.len() {
                continue;
            }
            if pattern
                .iter()
                .zip(&normalized)
                .all(|(p, t)| p == t)
                && best.is_none_or(|(b, _)| pattern.len() > b.len())
            {
                best = Some(entry);
            }
        }

        match best {
            Some((pattern, handler)) => handler(ctx, env, &tokens[pattern.len()..]),
            None => {
                trace!(
                    requester = env.requester_id,
                    request = %tokens.join(" "),
                    "no handler for request"
                );
                Outcome::Unhandled
            }
        }
    }
}

impl<C> Default for HandlerTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx {
        hits: Vec<&'static str>,
    }

    fn env() -> RequestEnv {
        RequestEnv {
            requester_id: 1,
            requester_name: "z01".into(),
            tracker: None,
        }
    }

    fn table() -> HandlerTable<Ctx> {
        let mut t = HandlerTable::new();
        t.register("ping", |c: &mut Ctx, _, _| {
            c.hits.push("ping");
            Outcome::Reply(vec!["pong".into()])
        });
        t.register("Link CTL", |c: &mut Ctx, _, _| {
            c.hits.push("link_ctl");
            Outcome::Done
        });
        t.register("Link CTL Peer-Attribute", |c: &mut Ctx, _, args| {
            c.hits.push("peer_attribute");
            assert!(args.is_empty());
            Outcome::Done
        });
        t.register("Link CTL ACK", |c: &mut Ctx, _, args| {
            c.hits.push("ack");
            assert_eq!(args.len(), 1);
            Outcome::Done
        });
        t
    }

    #[test]
    fn longest_prefix_wins() {
        let mut ctx = Ctx { hits: vec![] };
        let t = table();
        t.dispatch(&mut ctx, &env(), &["Link", "CTL", "Peer-Attribute"]);
        assert_eq!(ctx.hits, vec!["peer_attribute"]);
    }

    #[test]
    fn shorter_prefix_catches_the_rest() {
        let mut ctx = Ctx { hits: vec![] };
        let t = table();
        t.dispatch(&mut ctx, &env(), &["Link", "CTL", "NAK"]);
        assert_eq!(ctx.hits, vec!["link_ctl"]);
    }

    #[test]
    fn remaining_tokens_become_args() {
        let mut ctx = Ctx { hits: vec![] };
        let t = table();
        t.dispatch(&mut ctx, &env(), &["Link", "CTL", "ACK", "C-Class=Switch,SID0=27"]);
        assert_eq!(ctx.hits, vec!["ack"]);
    }

    #[test]
    fn hyphen_and_underscore_are_interchangeable() {
        let mut ctx = Ctx { hits: vec![] };
        let t = table();
        t.dispatch(&mut ctx, &env(), &["Link", "CTL", "Peer_Attribute"]);
        assert_eq!(ctx.hits, vec!["peer_attribute"]);
    }

    #[test]
    fn unknown_request_is_unhandled() {
        let mut ctx = Ctx { hits: vec![] };
        let t = table();
        let outcome = t.dispatch(&mut ctx, &env(), &["warble"]);
        assert_eq!(outcome, Outcome::Unhandled);
        assert!(ctx.hits.is_empty());
    }
}
