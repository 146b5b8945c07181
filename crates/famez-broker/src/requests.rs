//! Switch-side request handlers.
//!
//! Runs in the context of the broker: a doorbell fired, the requester's
//! mailslot has been drained, and the payload is dispatched here. Every
//! handler is synchronous and returns an [`Outcome`]; the doorbell task
//! performs the actual mailbox writes and rings afterwards, outside the
//! registry lock.

use tracing::{debug, info, warn};

use famez_fabric::{HandlerTable, Outcome, RequestEnv, csv_to_map};

use crate::broker::BrokerState;
use crate::config::{BrokerConfig, SWITCH_CCLASS};

/// What a switch handler can see and touch.
pub struct SwitchCtx<'a> {
    pub cfg: &'a BrokerConfig,
    pub state: &'a mut BrokerState,
}

/// Dispatch one parsed request against the switch handler table.
pub fn dispatch_switch(
    cfg: &BrokerConfig,
    state: &mut BrokerState,
    env: &RequestEnv,
    tokens: &[&str],
) -> Outcome {
    let table = switch_table();
    let mut ctx = SwitchCtx { cfg, state };
    table.dispatch(&mut ctx, env, tokens)
}

fn switch_table<'a>() -> HandlerTable<SwitchCtx<'a>> {
    let mut table = HandlerTable::new();
    table.register("ping", ping);
    table.register("dump", dump);
    table.register("Link CTL", link_ctl);
    table.register("Link CTL Peer-Attribute", link_ctl_peer_attribute);
    table.register("Link CTL ACK", link_ctl_ack);
    table.register("Link CTL NAK", link_ctl_nak);
    table.register("Link RFC", link_rfc);
    table.register("Standalone Acknowledgment", standalone_acknowledgment);
    table
}

fn ping(_ctx: &mut SwitchCtx, _env: &RequestEnv, _args: &[&str]) -> Outcome {
    Outcome::Reply(vec!["pong".to_string()])
}

fn dump(_ctx: &mut SwitchCtx, _env: &RequestEnv, _args: &[&str]) -> Outcome {
    Outcome::Dump
}

/// Gen-Z 1.0 "11.11 Link CTL" fallback for subcommands nobody claimed.
fn link_ctl(_ctx: &mut SwitchCtx, env: &RequestEnv, args: &[&str]) -> Outcome {
    info!("Got {:?} from {}", args, env.requester_id);
    Outcome::Unhandled
}

/// A peer probes the switch identity; answer with our attributes.
fn link_ctl_peer_attribute(ctx: &mut SwitchCtx, _env: &RequestEnv, _args: &[&str]) -> Outcome {
    let attrs = format!(
        "Link CTL ACK C-Class={},CID0={},SID0={}",
        SWITCH_CCLASS, ctx.cfg.server_cid0, ctx.cfg.server_sid0
    );
    Outcome::Reply(vec![attrs])
}

/// The answer to our own Peer-Attribute probe: remember what the peer is.
fn link_ctl_ack(ctx: &mut SwitchCtx, env: &RequestEnv, args: &[&str]) -> Outcome {
    let Some(csv) = args.first() else {
        return Outcome::Unhandled;
    };
    let attrs = csv_to_map(csv);
    match ctx.state.peers.get_mut(&env.requester_id) {
        Some(peer) => {
            debug!(id = env.requester_id, ?attrs, "peer attributes stored");
            peer.peer_attrs = attrs;
            Outcome::Done
        }
        None => Outcome::Unhandled,
    }
}

fn link_ctl_nak(_ctx: &mut SwitchCtx, env: &RequestEnv, _args: &[&str]) -> Outcome {
    warn!(
        from = env.requester_id,
        "Got a NAK, not sure what to do with it"
    );
    Outcome::Done
}

/// Gen-Z 1.0 "11.6 Link RFC": a peer asks to be configured. Only a smart
/// broker (fabric manager) answers, and only for delays quoted in
/// microseconds; anything longer than our cycle time is dropped.
fn link_rfc(ctx: &mut SwitchCtx, env: &RequestEnv, args: &[&str]) -> Outcome {
    if !ctx.cfg.smart {
        info!("I am not a manager");
        return Outcome::Unhandled;
    }
    let kv = args.first().map(|csv| csv_to_map(csv)).unwrap_or_default();
    let Some(delay) = kv.get("TTC") else {
        info!("{}: Link RFC missing TTC", env.requester_id);
        return Outcome::Unhandled;
    };
    if !delay.to_lowercase().contains("us") {
        info!("Delay {} is too long, dropping request", delay);
        return Outcome::Unhandled;
    }

    let (sid0, cid0) = ctx
        .state
        .peers
        .get(&env.requester_id)
        .map(|p| (p.sid0, p.cid0))
        .unwrap_or((0, 0));
    let response = format!(
        "CTL-Write Space=0,PFMSID={},PFMCID={},SID={},CID={}",
        ctx.cfg.server_sid0, ctx.cfg.server_cid0, sid0, cid0
    );
    let (tag, tagged) =
        ctx.state
            .correlator
            .tag(sid0, cid0, &response, Some("Link CTL Peer-Attribute"));
    debug!(tag, id = env.requester_id, "Link RFC accepted");
    Outcome::Reply(vec![tagged])
}

/// Gen-Z 1.0 "6.8 Standalone Acknowledgment": retire the tag, then honor
/// any AfterACK hint stashed with it.
fn standalone_acknowledgment(ctx: &mut SwitchCtx, env: &RequestEnv, args: &[&str]) -> Outcome {
    let Some(csv) = args.first() else {
        return Outcome::Unhandled;
    };
    let kv = csv_to_map(csv);
    let tag = kv.get("Tag").and_then(|t| t.parse::<u32>().ok());
    match tag.and_then(|t| ctx.state.correlator.complete(t)) {
        Some(entry) => match entry.after_ack {
            Some(after) => Outcome::Reply(vec![after]),
            None => Outcome::Done,
        },
        None => {
            warn!(
                "UNTAGGING {}:{} FAILED",
                env.requester_id, env.requester_name
            );
            Outcome::Unhandled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Peer, PeerPhase};
    use famez_fabric::{Correlator, Tracker};
    use std::collections::{BTreeMap, HashMap};
    use std::path::PathBuf;
    use std::rc::Rc;

    fn cfg(smart: bool) -> BrokerConfig {
        BrokerConfig::resolve(
            "famez_mailbox".into(),
            PathBuf::from("/tmp/famez_socket"),
            2,
            false,
            smart,
            true,
            0,
            None,
        )
        .unwrap()
    }

    fn state() -> BrokerState {
        BrokerState {
            peers: BTreeMap::new(),
            recycled: HashMap::new(),
            correlator: Correlator::new(),
            tracker: Tracker::new(),
        }
    }

    async fn state_with_peer(id: u64) -> BrokerState {
        let (a, _b) = tokio::net::UnixStream::pair().unwrap();
        let mut st = state();
        st.peers.insert(
            id,
            Peer {
                id,
                stream: Rc::new(a),
                vectors: Rc::new(famez_wire::notifier_list(4).unwrap()),
                sid0: 0,
                cid0: 0,
                peer_attrs: HashMap::new(),
                phase: PeerPhase::Operational,
            },
        );
        st
    }

    fn env(id: u64) -> RequestEnv {
        RequestEnv {
            requester_id: id,
            requester_name: format!("z{:02}", id),
            tracker: None,
        }
    }

    #[test]
    fn ping_pongs() {
        let cfg = cfg(false);
        let mut st = state();
        let outcome = dispatch_switch(&cfg, &mut st, &env(1), &["ping"]);
        assert_eq!(outcome, Outcome::Reply(vec!["pong".into()]));
    }

    #[test]
    fn peer_attribute_reports_switch_identity() {
        let cfg = cfg(true);
        let mut st = state();
        let outcome =
            dispatch_switch(&cfg, &mut st, &env(1), &["Link", "CTL", "Peer-Attribute"]);
        assert_eq!(
            outcome,
            Outcome::Reply(vec![
                "Link CTL ACK C-Class=FabricSwitch,CID0=300,SID0=27".into()
            ])
        );
    }

    #[tokio::test]
    async fn link_rfc_needs_a_manager() {
        let cfg = cfg(false);
        let mut st = state_with_peer(1).await;
        let outcome =
            dispatch_switch(&cfg, &mut st, &env(1), &["Link", "RFC", "TTC=10us"]);
        assert_eq!(outcome, Outcome::Unhandled);
        assert_eq!(st.correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn link_rfc_emits_a_tagged_ctl_write() {
        let cfg = cfg(true);
        let mut st = state_with_peer(1).await;
        let outcome =
            dispatch_switch(&cfg, &mut st, &env(1), &["Link", "RFC", "TTC=10us"]);
        assert_eq!(
            outcome,
            Outcome::Reply(vec![
                "CTL-Write Space=0,PFMSID=27,PFMCID=300,SID=0,CID=0,Tag=1".into()
            ])
        );
        assert_eq!(st.correlator.outstanding(), 1);
    }

    #[tokio::test]
    async fn slow_link_rfc_is_dropped() {
        let cfg = cfg(true);
        let mut st = state_with_peer(1).await;
        let outcome =
            dispatch_switch(&cfg, &mut st, &env(1), &["Link", "RFC", "TTC=10ms"]);
        assert_eq!(outcome, Outcome::Unhandled);
    }

    #[tokio::test]
    async fn acknowledgment_retires_the_tag_and_fires_after_ack() {
        let cfg = cfg(true);
        let mut st = state_with_peer(1).await;
        dispatch_switch(&cfg, &mut st, &env(1), &["Link", "RFC", "TTC=10us"]);

        let outcome = dispatch_switch(
            &cfg,
            &mut st,
            &env(1),
            &["Standalone", "Acknowledgment", "Tag=1,Reason=OK"],
        );
        assert_eq!(
            outcome,
            Outcome::Reply(vec!["Link CTL Peer-Attribute".into()])
        );
        assert_eq!(st.correlator.outstanding(), 0);
    }

    #[test]
    fn unknown_tag_logs_and_continues() {
        let cfg = cfg(true);
        let mut st = state();
        let outcome = dispatch_switch(
            &cfg,
            &mut st,
            &env(1),
            &["Standalone", "Acknowledgment", "Tag=9,Reason=OK"],
        );
        assert_eq!(outcome, Outcome::Unhandled);
    }

    #[tokio::test]
    async fn ack_stores_peer_attributes() {
        let cfg = cfg(true);
        let mut st = state_with_peer(1).await;
        let outcome = dispatch_switch(
            &cfg,
            &mut st,
            &env(1),
            &["Link", "CTL", "ACK", "C-Class=Debugger,SID0=27,CID0=100"],
        );
        assert_eq!(outcome, Outcome::Done);
        let attrs = &st.peers[&1].peer_attrs;
        assert_eq!(attrs.get("C-Class").map(String::as_str), Some("Debugger"));
    }
}
