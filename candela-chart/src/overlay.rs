//! Pending orders rendered on the price axis: hit-testing, drag-to-reprice
//! and click-to-cancel, reconciled against the broker through the
//! [`OrderGateway`] collaborator.
//!
//! The drag gesture is an explicit state machine. While a drag is live the
//! stored order is untouched; only `drag_end` commits the new price, and it
//! commits optimistically: the local price flips first and rolls back if the
//! broker rejects the modify.

use crate::coords::PriceScale;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};
use vecmap::VecMap;

/// Minimum relative price change before a drag is committed to the broker.
pub const MATERIALITY_THRESHOLD: f64 = 0.002;

pub type OrderId = SmolStr;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One working order shown on the overlay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub order_id: OrderId,
    pub symbol: SmolStr,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
}

/// Request to create a new working order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub symbol: SmolStr,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
}

/// Price and/or quantity amendment for an existing order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModifyOrder {
    pub order_id: OrderId,
    pub price: Option<f64>,
    pub qty: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("unknown order: {0}")]
    UnknownOrder(OrderId),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }
}

/// External order-management collaborator. The overlay only ever talks to
/// the broker through this seam, which is what makes the optimistic state
/// testable.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, spec: OrderSpec) -> Result<PendingOrder, GatewayError>;
    async fn modify_order(&self, request: ModifyOrder) -> Result<(), GatewayError>;
    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), GatewayError>;
}

/// Pixel layout of an order marker: a fixed-size rectangle hanging off the
/// right edge plus a circular cancel control to its right.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OverlayLayout {
    pub order_width: f64,
    pub order_height: f64,
    pub margin: f64,
    pub cancel_gap: f64,
    pub cancel_radius: f64,
}

impl Default for OverlayLayout {
    fn default() -> Self {
        Self {
            order_width: 72.0,
            order_height: 18.0,
            margin: 28.0,
            cancel_gap: 6.0,
            cancel_radius: 7.0,
        }
    }
}

/// What a pointer position landed on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OverlayHit {
    Body(OrderId),
    Cancel(OrderId),
}

/// Drag gesture state. At most one order is the drag target at a time.
#[derive(Clone, Debug, PartialEq)]
pub enum DragState {
    Idle,
    Dragging {
        order_id: OrderId,
        start_price: f64,
        live_price: f64,
    },
}

/// How a finished drag resolved.
#[derive(Clone, Debug, PartialEq)]
pub enum DragOutcome {
    /// Change was material and the broker accepted the modify.
    Committed { order_id: OrderId, price: f64 },
    /// Local price restored to the pre-drag value.
    RolledBack {
        order_id: OrderId,
        price: f64,
        reason: RollbackReason,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum RollbackReason {
    BelowThreshold,
    RequestFailed(GatewayError),
}

/// Draw-pass geometry for one order marker.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderMarker {
    pub order_id: OrderId,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub cancel_x: f64,
    pub cancel_y: f64,
    pub cancel_radius: f64,
    pub dragging: bool,
}

/// Controller for the order overlay of one chart.
#[derive(Debug)]
pub struct OrderOverlay {
    orders: VecMap<OrderId, PendingOrder>,
    drag: DragState,
    layout: OverlayLayout,
}

impl Default for OrderOverlay {
    fn default() -> Self {
        Self::new(OverlayLayout::default())
    }
}

impl OrderOverlay {
    pub fn new(layout: OverlayLayout) -> Self {
        Self {
            orders: VecMap::new(),
            drag: DragState::Idle,
            layout,
        }
    }

    pub fn layout(&self) -> &OverlayLayout {
        &self.layout
    }

    pub fn drag_state(&self) -> &DragState {
        &self.drag
    }

    pub fn orders(&self) -> impl Iterator<Item = &PendingOrder> {
        self.orders.values()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Replace the working set from a broker order-book snapshot.
    ///
    /// A drag whose target vanished in the snapshot is abandoned, otherwise
    /// the gesture continues over the refreshed order.
    pub fn sync_orders(&mut self, snapshot: Vec<PendingOrder>) {
        self.orders.clear();
        for order in snapshot {
            self.orders.insert(order.order_id.clone(), order);
        }
        if let DragState::Dragging { order_id, .. } = &self.drag {
            if !self.orders.contains_key(order_id) {
                debug!(%order_id, "drag target disappeared from snapshot");
                self.drag = DragState::Idle;
            }
        }
    }

    /// Insert or refresh a single order, eg. from a new order confirmation.
    pub fn upsert_order(&mut self, order: PendingOrder) {
        self.orders.insert(order.order_id.clone(), order);
    }

    pub fn remove_order(&mut self, order_id: &OrderId) -> Option<PendingOrder> {
        self.orders.remove(order_id)
    }

    fn marker_for(&self, order: &PendingOrder, right_edge: f64, scale: &PriceScale, dragging: bool, price: f64) -> OrderMarker {
        let OverlayLayout {
            order_width,
            order_height,
            margin,
            cancel_gap,
            cancel_radius,
        } = self.layout;
        let x = right_edge - order_width - margin;
        let center_y = scale.price_to_y(price);
        OrderMarker {
            order_id: order.order_id.clone(),
            side: order.side,
            price,
            qty: order.qty,
            x,
            y: center_y - order_height / 2.0,
            width: order_width,
            height: order_height,
            cancel_x: x + order_width + cancel_gap + cancel_radius,
            cancel_y: center_y,
            cancel_radius,
            dragging,
        }
    }

    /// Markers for the normal draw pass. The active drag target is
    /// suppressed here and drawn separately on top via [`Self::drag_marker`].
    pub fn markers(&self, right_edge: f64, scale: &PriceScale) -> Vec<OrderMarker> {
        let dragged = match &self.drag {
            DragState::Dragging { order_id, .. } => Some(order_id.clone()),
            DragState::Idle => None,
        };
        self.orders
            .values()
            .filter(|order| dragged.as_ref() != Some(&order.order_id))
            .map(|order| self.marker_for(order, right_edge, scale, false, order.price))
            .collect()
    }

    /// Marker for the active drag target at the live pointer price.
    pub fn drag_marker(&self, right_edge: f64, scale: &PriceScale) -> Option<OrderMarker> {
        match &self.drag {
            DragState::Dragging {
                order_id,
                live_price,
                ..
            } => self
                .orders
                .get(order_id)
                .map(|order| self.marker_for(order, right_edge, scale, true, *live_price)),
            DragState::Idle => None,
        }
    }

    /// What, if anything, the pointer is over. Orders draw in insertion
    /// order, so the last match is the topmost marker and wins ties.
    pub fn hit_test(&self, px: f64, py: f64, right_edge: f64, scale: &PriceScale) -> Option<OverlayHit> {
        let mut hit = None;
        for order in self.orders.values() {
            let marker = self.marker_for(order, right_edge, scale, false, order.price);
            let dx = px - marker.cancel_x;
            let dy = py - marker.cancel_y;
            if dx * dx + dy * dy <= marker.cancel_radius * marker.cancel_radius {
                hit = Some(OverlayHit::Cancel(order.order_id.clone()));
            } else if px >= marker.x
                && px <= marker.x + marker.width
                && py >= marker.y
                && py <= marker.y + marker.height
            {
                hit = Some(OverlayHit::Body(order.order_id.clone()));
            }
        }
        hit
    }

    /// Begin dragging an order. Refused while another drag is live or when
    /// the order is unknown.
    pub fn drag_start(&mut self, order_id: &OrderId) -> bool {
        if !matches!(self.drag, DragState::Idle) {
            return false;
        }
        let Some(order) = self.orders.get(order_id) else {
            return false;
        };
        self.drag = DragState::Dragging {
            order_id: order.order_id.clone(),
            start_price: order.price,
            live_price: order.price,
        };
        true
    }

    /// Track the pointer: update the drag's local-only price. The stored
    /// order is not touched until `drag_end`.
    pub fn drag(&mut self, y: f64, scale: &PriceScale) {
        if let DragState::Dragging { live_price, .. } = &mut self.drag {
            *live_price = scale.y_to_price(y);
        }
    }

    /// Finish the drag and reconcile with the broker.
    ///
    /// A change of at least [`MATERIALITY_THRESHOLD`] issues exactly one
    /// modify request, keeping the new price optimistically and rolling back
    /// if the request fails. A smaller change rolls back unconditionally
    /// without a request. Returns `None` when no drag was live.
    pub async fn drag_end(&mut self, gateway: &dyn OrderGateway) -> Option<DragOutcome> {
        let DragState::Dragging {
            order_id,
            start_price,
            live_price,
        } = std::mem::replace(&mut self.drag, DragState::Idle)
        else {
            return None;
        };

        if !self.orders.contains_key(&order_id) {
            debug!(%order_id, "drag ended on an order that no longer exists");
            return None;
        }

        let relative_change = (live_price - start_price).abs() / start_price.abs().max(f64::EPSILON);
        if !relative_change.is_finite() || relative_change < MATERIALITY_THRESHOLD {
            return Some(DragOutcome::RolledBack {
                order_id,
                price: start_price,
                reason: RollbackReason::BelowThreshold,
            });
        }

        // optimistic: flip the local price before the broker answers
        if let Some(order) = self.orders.get_mut(&order_id) {
            order.price = live_price;
        }

        let request = ModifyOrder {
            order_id: order_id.clone(),
            price: Some(live_price),
            qty: None,
        };
        match gateway.modify_order(request).await {
            Ok(()) => Some(DragOutcome::Committed {
                order_id,
                price: live_price,
            }),
            Err(err) => {
                warn!(%order_id, %err, "modify rejected, rolling back");
                if let Some(order) = self.orders.get_mut(&order_id) {
                    order.price = start_price;
                }
                Some(DragOutcome::RolledBack {
                    order_id,
                    price: start_price,
                    reason: RollbackReason::RequestFailed(err),
                })
            }
        }
    }

    /// Cancel an order at the broker; it leaves the overlay only when the
    /// broker confirms.
    pub async fn cancel(&mut self, order_id: &OrderId, gateway: &dyn OrderGateway) -> Result<(), GatewayError> {
        gateway.cancel_order(order_id).await?;
        self.orders.remove(order_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    struct MockGateway {
        modify_calls: AtomicUsize,
        cancel_calls: AtomicUsize,
        fail_modify: bool,
        fail_cancel: bool,
    }

    impl MockGateway {
        fn accepting() -> Self {
            Self {
                modify_calls: AtomicUsize::new(0),
                cancel_calls: AtomicUsize::new(0),
                fail_modify: false,
                fail_cancel: false,
            }
        }

        fn rejecting() -> Self {
            Self {
                fail_modify: true,
                fail_cancel: true,
                ..Self::accepting()
            }
        }
    }

    #[async_trait]
    impl OrderGateway for MockGateway {
        async fn place_order(&self, spec: OrderSpec) -> Result<PendingOrder, GatewayError> {
            Ok(PendingOrder {
                order_id: SmolStr::new("ord-1"),
                symbol: spec.symbol,
                side: spec.side,
                price: spec.price,
                qty: spec.qty,
            })
        }

        async fn modify_order(&self, request: ModifyOrder) -> Result<(), GatewayError> {
            self.modify_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_modify {
                Err(GatewayError::Rejected("no".into()))
            } else {
                let _ = request;
                Ok(())
            }
        }

        async fn cancel_order(&self, order_id: &OrderId) -> Result<(), GatewayError> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_cancel {
                Err(GatewayError::UnknownOrder(order_id.clone()))
            } else {
                Ok(())
            }
        }
    }

    fn order(id: &str, price: f64) -> PendingOrder {
        PendingOrder {
            order_id: SmolStr::new(id),
            symbol: SmolStr::new("BTCUSD"),
            side: Side::Buy,
            price,
            qty: 1.0,
        }
    }

    fn scale() -> PriceScale {
        PriceScale::new(90.0, 110.0, 200.0, 0.0, 1.0)
    }

    fn overlay_with(orders: Vec<PendingOrder>) -> OrderOverlay {
        let mut overlay = OrderOverlay::default();
        overlay.sync_orders(orders);
        overlay
    }

    #[test]
    fn test_hit_test_regions() {
        struct TestCase {
            input: (f64, f64),
            expected: Option<OverlayHit>,
        }

        // price 100 maps to y=100; rect x in [300, 372], y in [91, 109];
        // cancel circle centered at (385, 100) radius 7
        let overlay = overlay_with(vec![order("ord-1", 100.0)]);
        let cases = vec![
            // TC0: inside the body rectangle
            TestCase {
                input: (350.0, 105.0),
                expected: Some(OverlayHit::Body(SmolStr::new("ord-1"))),
            },
            // TC1: center of the cancel circle
            TestCase {
                input: (385.0, 100.0),
                expected: Some(OverlayHit::Cancel(SmolStr::new("ord-1"))),
            },
            // TC2: just inside the cancel radius
            TestCase {
                input: (385.0, 106.0),
                expected: Some(OverlayHit::Cancel(SmolStr::new("ord-1"))),
            },
            // TC3: just outside the cancel radius and right of the body
            TestCase {
                input: (385.0, 108.0),
                expected: None,
            },
            // TC4: left of the marker entirely
            TestCase {
                input: (200.0, 100.0),
                expected: None,
            },
            // TC5: above the body rectangle
            TestCase {
                input: (350.0, 80.0),
                expected: None,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let actual = overlay.hit_test(test.input.0, test.input.1, 400.0, &scale());
            assert_eq!(actual, test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_topmost_order_wins_overlapping_hits() {
        let overlay = overlay_with(vec![order("below", 100.0), order("above", 100.2)]);
        // both rectangles cover this point; the later-inserted order is
        // drawn on top and must win
        let hit = overlay.hit_test(350.0, 100.0, 400.0, &scale());
        assert_eq!(hit, Some(OverlayHit::Body(SmolStr::new("above"))));
    }

    #[tokio::test]
    async fn test_small_drag_rolls_back_without_request() {
        let gateway = MockGateway::accepting();
        let mut overlay = overlay_with(vec![order("ord-1", 100.0)]);
        let id = SmolStr::new("ord-1");

        assert!(overlay.drag_start(&id));
        // 0.1% move: below the 0.2% materiality threshold
        let y = scale().price_to_y(100.1);
        overlay.drag(y, &scale());
        let outcome = overlay.drag_end(&gateway).await;

        assert_eq!(
            outcome,
            Some(DragOutcome::RolledBack {
                order_id: id.clone(),
                price: 100.0,
                reason: RollbackReason::BelowThreshold,
            })
        );
        assert_eq!(gateway.modify_calls.load(Ordering::SeqCst), 0);
        assert_eq!(overlay.orders().next().map(|o| o.price), Some(100.0));
        assert_eq!(overlay.drag_state(), &DragState::Idle);
    }

    #[tokio::test]
    async fn test_material_drag_commits_once() {
        let gateway = MockGateway::accepting();
        let mut overlay = overlay_with(vec![order("ord-1", 100.0)]);
        let id = SmolStr::new("ord-1");

        assert!(overlay.drag_start(&id));
        let y = scale().price_to_y(101.0);
        overlay.drag(y, &scale());
        let outcome = overlay.drag_end(&gateway).await;

        match outcome {
            Some(DragOutcome::Committed { price, .. }) => {
                assert!((price - 101.0).abs() < 1e-9);
            }
            other => panic!("expected commit, got {other:?}"),
        }
        assert_eq!(gateway.modify_calls.load(Ordering::SeqCst), 1);
        let stored = overlay.orders().next().map(|o| o.price).unwrap();
        assert!((stored - 101.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_modify_rolls_back() {
        let gateway = MockGateway::rejecting();
        let mut overlay = overlay_with(vec![order("ord-1", 100.0)]);
        let id = SmolStr::new("ord-1");

        assert!(overlay.drag_start(&id));
        overlay.drag(scale().price_to_y(102.0), &scale());
        let outcome = overlay.drag_end(&gateway).await;

        match outcome {
            Some(DragOutcome::RolledBack {
                price,
                reason: RollbackReason::RequestFailed(_),
                ..
            }) => assert_eq!(price, 100.0),
            other => panic!("expected rollback, got {other:?}"),
        }
        assert_eq!(gateway.modify_calls.load(Ordering::SeqCst), 1);
        assert_eq!(overlay.orders().next().map(|o| o.price), Some(100.0));
    }

    #[tokio::test]
    async fn test_only_one_drag_target_at_a_time() {
        let mut overlay = overlay_with(vec![order("a", 100.0), order("b", 105.0)]);
        assert!(overlay.drag_start(&SmolStr::new("a")));
        assert!(!overlay.drag_start(&SmolStr::new("b")));
        assert!(!overlay.drag_start(&SmolStr::new("missing")));

        // the draw pass suppresses the drag target, which reappears on top
        overlay.drag(scale().price_to_y(95.0), &scale());
        let markers = overlay.markers(400.0, &scale());
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].order_id, SmolStr::new("b"));

        let drag = overlay.drag_marker(400.0, &scale()).expect("drag marker");
        assert!(drag.dragging);
        assert!((drag.price - 95.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_drag_end_without_drag_is_none() {
        let gateway = MockGateway::accepting();
        let mut overlay = overlay_with(vec![order("ord-1", 100.0)]);
        assert_eq!(overlay.drag_end(&gateway).await, None);
        assert_eq!(gateway.modify_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_snapshot_abandons_vanished_drag_target() {
        let mut overlay = overlay_with(vec![order("ord-1", 100.0)]);
        assert!(overlay.drag_start(&SmolStr::new("ord-1")));
        overlay.sync_orders(vec![order("ord-2", 104.0)]);
        assert_eq!(overlay.drag_state(), &DragState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_removes_only_on_success() {
        let id = SmolStr::new("ord-1");

        let accepting = MockGateway::accepting();
        let mut overlay = overlay_with(vec![order("ord-1", 100.0)]);
        tokio_test::assert_ok!(overlay.cancel(&id, &accepting).await);
        assert!(overlay.is_empty());

        let rejecting = MockGateway::rejecting();
        let mut overlay = overlay_with(vec![order("ord-1", 100.0)]);
        assert!(overlay.cancel(&id, &rejecting).await.is_err());
        assert_eq!(overlay.len(), 1);
    }

    #[tokio::test]
    async fn test_place_confirmation_flows_into_overlay() {
        let gateway = MockGateway::accepting();
        let mut overlay = OrderOverlay::default();

        let confirmed = gateway
            .place_order(OrderSpec {
                symbol: SmolStr::new("BTCUSD"),
                side: Side::Sell,
                price: 108.0,
                qty: 0.5,
            })
            .await
            .expect("place");
        overlay.upsert_order(confirmed);
        assert_eq!(overlay.len(), 1);
    }
}
