//! Base protocol messages: CER/CEA, DWR/DWA, DPR/DPA (RFC 6733 Section 5)
//!
//! These never reach applications; the connection task answers them itself.

use std::net::IpAddr;

use crate::application::ApplicationRole;
use crate::avp::{Avp, AvpData};
use crate::common::{app_id, avp_code, DisconnectCause};
use crate::error::ResultCode;
use crate::message::{base_cmd, DiameterMessage};
use crate::session::IdSequence;

/// What the local node advertises about itself
#[derive(Debug, Clone)]
pub(crate) struct LocalIdentity {
    pub origin_host: String,
    pub origin_realm: String,
    pub vendor_id: u32,
    pub product_name: String,
    pub origin_state_id: u32,
}

impl LocalIdentity {
    fn request(&self, command_code: u32, ids: &IdSequence) -> DiameterMessage {
        let mut msg = DiameterMessage::new_request(command_code, app_id::BASE);
        msg.header.hop_by_hop_id = ids.next_hop_by_hop();
        msg.header.end_to_end_id = ids.next_end_to_end();
        msg.add_avp(Avp::identity(avp_code::ORIGIN_HOST, &self.origin_host));
        msg.add_avp(Avp::identity(avp_code::ORIGIN_REALM, &self.origin_realm));
        msg
    }

    fn answer(&self, request: &DiameterMessage, result_code: ResultCode) -> DiameterMessage {
        DiameterMessage::answer_with_result(
            request,
            &self.origin_host,
            &self.origin_realm,
            result_code,
            None,
        )
    }

    fn add_capabilities(
        &self,
        msg: &mut DiameterMessage,
        host_ip: IpAddr,
        applications: &[(u32, ApplicationRole)],
    ) {
        msg.add_avp(Avp::mandatory(avp_code::HOST_IP_ADDRESS, AvpData::Address(host_ip)));
        msg.add_avp(Avp::unsigned32(avp_code::VENDOR_ID, self.vendor_id));
        msg.add_avp(Avp::optional(
            avp_code::PRODUCT_NAME,
            AvpData::Utf8String(self.product_name.clone()),
        ));
        msg.add_avp(Avp::unsigned32(avp_code::ORIGIN_STATE_ID, self.origin_state_id));
        for (id, role) in applications {
            let code = match role {
                ApplicationRole::Auth => avp_code::AUTH_APPLICATION_ID,
                ApplicationRole::Acct => avp_code::ACCT_APPLICATION_ID,
            };
            msg.add_avp(Avp::unsigned32(code, *id));
        }
    }

    pub(crate) fn capabilities_exchange_request(
        &self,
        ids: &IdSequence,
        host_ip: IpAddr,
        applications: &[(u32, ApplicationRole)],
    ) -> DiameterMessage {
        let mut cer = self.request(base_cmd::CAPABILITIES_EXCHANGE, ids);
        self.add_capabilities(&mut cer, host_ip, applications);
        cer
    }

    pub(crate) fn capabilities_exchange_answer(
        &self,
        cer: &DiameterMessage,
        result_code: ResultCode,
        host_ip: IpAddr,
        applications: &[(u32, ApplicationRole)],
    ) -> DiameterMessage {
        let mut cea = self.answer(cer, result_code);
        self.add_capabilities(&mut cea, host_ip, applications);
        cea
    }

    pub(crate) fn device_watchdog_request(&self, ids: &IdSequence) -> DiameterMessage {
        let mut dwr = self.request(base_cmd::DEVICE_WATCHDOG, ids);
        dwr.add_avp(Avp::unsigned32(avp_code::ORIGIN_STATE_ID, self.origin_state_id));
        dwr
    }

    pub(crate) fn device_watchdog_answer(&self, dwr: &DiameterMessage) -> DiameterMessage {
        let mut dwa = self.answer(dwr, ResultCode::Success);
        dwa.add_avp(Avp::unsigned32(avp_code::ORIGIN_STATE_ID, self.origin_state_id));
        dwa
    }

    pub(crate) fn disconnect_peer_request(
        &self,
        ids: &IdSequence,
        cause: DisconnectCause,
    ) -> DiameterMessage {
        let mut dpr = self.request(base_cmd::DISCONNECT_PEER, ids);
        dpr.add_avp(Avp::mandatory(
            avp_code::DISCONNECT_CAUSE,
            AvpData::Enumerated(cause as i32),
        ));
        dpr
    }

    pub(crate) fn disconnect_peer_answer(&self, dpr: &DiameterMessage) -> DiameterMessage {
        self.answer(dpr, ResultCode::Success)
    }
}

pub(crate) fn disconnect_cause(dpr: &DiameterMessage) -> Option<DisconnectCause> {
    dpr.find_avp(avp_code::DISCONNECT_CAUSE)
        .and_then(Avp::as_u32)
        .and_then(DisconnectCause::from_code)
}

/// Whether `msg` is a base protocol message handled inside the peer
pub(crate) fn is_base_message(msg: &DiameterMessage) -> bool {
    msg.application_id() == app_id::BASE
        && matches!(
            msg.command_code(),
            base_cmd::CAPABILITIES_EXCHANGE | base_cmd::DEVICE_WATCHDOG | base_cmd::DISCONNECT_PEER
        )
}

/// Local applications the remote side also supports.
///
/// An application is common when the remote advertises the same id in the
/// same role, or advertises the relay application.
pub(crate) fn common_applications(
    local: &[(u32, ApplicationRole)],
    remote_auth: &[u32],
    remote_acct: &[u32],
) -> Vec<u32> {
    let relay = remote_auth.contains(&app_id::RELAY) || remote_acct.contains(&app_id::RELAY);
    let mut common: Vec<u32> = local
        .iter()
        .filter(|(id, role)| {
            relay
                || match role {
                    ApplicationRole::Auth => remote_auth.contains(id),
                    ApplicationRole::Acct => remote_acct.contains(id),
                }
        })
        .map(|(id, _)| *id)
        .collect();
    common.sort_unstable();
    common.dedup();
    common
}
