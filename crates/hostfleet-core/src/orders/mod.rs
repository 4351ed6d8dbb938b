// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Order and payment pipeline.

mod coupon;
mod hooks;
mod pricing;
mod service;

pub use coupon::{AppliedCoupon, CouponEvaluator};
pub use hooks::{ActionGate, NoopTierHooks, OpenGate, TierHooks, actions};
pub use pricing::{OrderLine, PricedLine, Pricer, Term, UnitPrices, validate_addons};
pub use service::{
    DAYS_PER_MONTH, InstantOrder, OrderConfig, OrderService, PaymentSelection, ResizeQuote,
    ResizeTarget, SelectPaymentInput, prefixes,
};
