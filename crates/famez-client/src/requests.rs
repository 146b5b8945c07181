//! Client-side request handlers.
//!
//! The interesting ones close the configuration loop with a smart switch:
//! `CTL-Write` applies the fabric identity the manager assigned and
//! acknowledges it; `Link CTL Peer-Attribute` answers the switch's probe
//! with our own identity.

use tracing::{debug, info, warn};

use famez_fabric::{HandlerTable, Outcome, RequestEnv, csv_to_map};
use famez_mailbox::MailboxRegion;

use crate::session::{CLIENT_CCLASS, ClientState};

/// What a client handler can see and touch.
pub struct ClientCtx<'a> {
    pub state: &'a mut ClientState,
    pub my_id: u64,
    pub mailbox: &'a MailboxRegion,
}

/// Dispatch one parsed request against the client handler table.
pub fn dispatch_client(ctx: &mut ClientCtx, env: &RequestEnv, tokens: &[&str]) -> Outcome {
    client_table().dispatch(ctx, env, tokens)
}

fn client_table<'a>() -> HandlerTable<ClientCtx<'a>> {
    let mut table = HandlerTable::new();
    table.register("ping", ping);
    table.register("dump", dump);
    table.register("CTL-Write", ctl_write);
    table.register("Link CTL", link_ctl);
    table.register("Link CTL Peer-Attribute", link_ctl_peer_attribute);
    table.register("Link CTL ACK", link_ctl_ack);
    table.register("Link CTL NAK", link_ctl_nak);
    table.register("Standalone Acknowledgment", standalone_acknowledgment);
    table
}

fn ping(_ctx: &mut ClientCtx, _env: &RequestEnv, _args: &[&str]) -> Outcome {
    Outcome::Reply(vec!["pong".to_string()])
}

fn dump(_ctx: &mut ClientCtx, _env: &RequestEnv, _args: &[&str]) -> Outcome {
    Outcome::Dump
}

/// Gen-Z 1.0 "6.10.1 P2P Core": the manager writes our control space.
/// Space 0 carries the fabric identity; apply it and acknowledge.
fn ctl_write(ctx: &mut ClientCtx, env: &RequestEnv, args: &[&str]) -> Outcome {
    let Some(csv) = args.first() else {
        return Outcome::Unhandled;
    };
    let kv = csv_to_map(csv);
    if kv.get("Space").map(String::as_str) != Some("0") {
        return Outcome::Unhandled;
    }
    let sid = kv.get("SID").and_then(|v| v.parse::<u64>().ok());
    let cid = kv.get("CID").and_then(|v| v.parse::<u64>().ok());
    let (Some(sid), Some(cid)) = (sid, cid) else {
        warn!(from = env.requester_id, "CTL-Write without SID/CID");
        return Outcome::Unhandled;
    };

    ctx.state.sid0 = sid;
    ctx.state.cid0 = cid;
    ctx.state.configured = true;
    ctx.mailbox.set_peer_ids(ctx.my_id, sid, cid).ok();
    info!(sid, cid, "link configured");

    let Some(tag) = kv.get("Tag") else {
        warn!("CTL-Write carried no Tag; nothing to acknowledge");
        return Outcome::Done;
    };
    Outcome::Reply(vec![format!(
        "Standalone Acknowledgment Tag={},Reason=OK",
        tag
    )])
}

fn link_ctl(_ctx: &mut ClientCtx, env: &RequestEnv, args: &[&str]) -> Outcome {
    info!("Got {:?} from {}", args, env.requester_id);
    Outcome::Unhandled
}

/// The switch probes our attributes; answer with who we are.
fn link_ctl_peer_attribute(ctx: &mut ClientCtx, _env: &RequestEnv, _args: &[&str]) -> Outcome {
    let attrs = format!(
        "Link CTL ACK C-Class={},SID0={},CID0={}",
        CLIENT_CCLASS, ctx.state.sid0, ctx.state.cid0
    );
    Outcome::Reply(vec![attrs])
}

fn link_ctl_ack(ctx: &mut ClientCtx, env: &RequestEnv, args: &[&str]) -> Outcome {
    let Some(csv) = args.first() else {
        return Outcome::Unhandled;
    };
    let attrs = csv_to_map(csv);
    debug!(from = env.requester_id, ?attrs, "peer attributes stored");
    ctx.state.peer_attrs.insert(env.requester_id, attrs);
    Outcome::Done
}

fn link_ctl_nak(_ctx: &mut ClientCtx, env: &RequestEnv, _args: &[&str]) -> Outcome {
    warn!(
        from = env.requester_id,
        "Got a NAK, not sure what to do with it"
    );
    Outcome::Done
}

fn standalone_acknowledgment(ctx: &mut ClientCtx, env: &RequestEnv, args: &[&str]) -> Outcome {
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
    use famez_fabric::{Correlator, Tracker};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn fresh_state() -> ClientState {
        ClientState {
            peers: BTreeMap::new(),
            inferred_server: None,
            prev_advert: None,
            ready: true,
            sid0: 0,
            cid0: 0,
            configured: false,
            peer_attrs: BTreeMap::new(),
            correlator: Correlator::new(),
            tracker: Tracker::new(),
        }
    }

    fn scratch_mailbox(tag: &str) -> (MailboxRegion, PathBuf) {
        let path =
            std::env::temp_dir().join(format!("famez_clreq_{}_{}", tag, std::process::id()));
        std::fs::remove_file(&path).ok();
        let region = MailboxRegion::create(path.to_str().unwrap(), 2, true).unwrap();
        (region, path)
    }

    fn env(from: u64) -> RequestEnv {
        RequestEnv {
            requester_id: from,
            requester_name: "Z-switch".into(),
            tracker: None,
        }
    }

    #[test]
    fn ctl_write_applies_identity_and_acknowledges() {
        let (mailbox, path) = scratch_mailbox("ctlwrite");
        let mut state = fresh_state();
        let mut ctx = ClientCtx {
            state: &mut state,
            my_id: 1,
            mailbox: &mailbox,
        };
        let outcome = dispatch_client(
            &mut ctx,
            &env(3),
            &[
                "CTL-Write",
                "Space=0,PFMSID=27,PFMCID=300,SID=0,CID=0,Tag=1",
            ],
        );
        assert_eq!(
            outcome,
            Outcome::Reply(vec!["Standalone Acknowledgment Tag=1,Reason=OK".into()])
        );
        assert!(state.configured);
        assert_eq!(state.sid0, 0);
        assert_eq!(mailbox.peer_sid(1).unwrap(), 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn ctl_write_ignores_other_spaces() {
        let (mailbox, path) = scratch_mailbox("space1");
        let mut state = fresh_state();
        let mut ctx = ClientCtx {
            state: &mut state,
            my_id: 1,
            mailbox: &mailbox,
        };
        let outcome = dispatch_client(
            &mut ctx,
            &env(3),
            &["CTL-Write", "Space=1,SID=9,CID=9,Tag=2"],
        );
        assert_eq!(outcome, Outcome::Unhandled);
        assert!(!state.configured);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn peer_attribute_probe_gets_our_identity() {
        let (mailbox, path) = scratch_mailbox("pa");
        let mut state = fresh_state();
        state.sid0 = 27;
        state.cid0 = 100;
        let mut ctx = ClientCtx {
            state: &mut state,
            my_id: 1,
            mailbox: &mailbox,
        };
        let outcome =
            dispatch_client(&mut ctx, &env(3), &["Link", "CTL", "Peer-Attribute"]);
        assert_eq!(
            outcome,
            Outcome::Reply(vec!["Link CTL ACK C-Class=Debugger,SID0=27,CID0=100".into()])
        );
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn ack_attributes_are_kept_per_sender() {
        let (mailbox, path) = scratch_mailbox("ack");
        let mut state = fresh_state();
        let mut ctx = ClientCtx {
            state: &mut state,
            my_id: 1,
            mailbox: &mailbox,
        };
        let outcome = dispatch_client(
            &mut ctx,
            &env(3),
            &["Link", "CTL", "ACK", "C-Class=FabricSwitch,CID0=300,SID0=27"],
        );
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(
            state.peer_attrs[&3].get("C-Class").map(String::as_str),
            Some("FabricSwitch")
        );
        std::fs::remove_file(&path).ok();
    }
}
