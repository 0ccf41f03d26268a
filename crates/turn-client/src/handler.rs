// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::IpAddr;

use async_trait::async_trait;
use bytes::Bytes;
use smol_str::SmolStr;
use stun_core::StunTuple;

use crate::error::TurnError;

/// Application callbacks for engine outcomes.
///
/// Every operation reports success or failure here; the failure
/// variants carry a typed [`TurnError`].
#[async_trait]
pub trait TurnHandler: Send + Sync + 'static {
    async fn on_bind_success(&self, reflexive: StunTuple);
    async fn on_bind_failure(&self, error: TurnError);

    async fn on_allocation_success(
        &self,
        reflexive: Option<StunTuple>,
        relay: Option<StunTuple>,
        lifetime: u32,
        bandwidth: u32,
    );
    async fn on_allocation_failure(&self, error: TurnError);

    async fn on_refresh_success(&self, lifetime: u32);
    async fn on_refresh_failure(&self, error: TurnError);

    async fn on_shared_secret_success(&self, username: SmolStr, password: SmolStr);
    async fn on_shared_secret_failure(&self, error: TurnError);

    async fn on_set_active_destination_success(&self);
    async fn on_set_active_destination_failure(&self, error: TurnError);
    async fn on_clear_active_destination_success(&self);
    async fn on_clear_active_destination_failure(&self, error: TurnError);

    async fn on_receive_success(&self, address: IpAddr, port: u16, data: Bytes);
    async fn on_receive_failure(&self, error: TurnError);
}
