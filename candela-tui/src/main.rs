/// Candela TUI - Terminal Chart Surface
///
/// Reference consumer of the candela engine:
/// - live candles + EMA band computed off-thread, redrawn through the
///   coalescing frame scheduler
/// - drawing annotations with undo/redo, persisted per symbol
/// - draggable order overlay reconciled through an order gateway
/// - connectivity indicators for the market-data and state-sync sockets
use std::{collections::VecDeque, env, io, sync::atomic::AtomicU64, sync::atomic::Ordering,
    time::Duration};

use async_trait::async_trait;
use candela_chart::{
    Candle, CandleColor, CandleSeries, Drawing, DrawingKind, DrawingPoint, DrawingStore,
    DrawingHistory, FrameScheduler, GatewayError, GeometryFrame, GeometryRequest, GeometryWorker,
    ModifyOrder, OrderGateway, OrderId, OrderOverlay, OrderSpec, OverlayHit, PendingOrder,
    PixelDims, Resolution, Side, UpsertOutcome, ViewState, fibonacci_levels, to_index_space,
};
use candela_feed::{
    ConnectionState, FeedClient, FeedConfig, FeedEvent, FeedEventKind, HistoryClient,
    NotificationLevel, StateBucket, SubscriptionKey, SyncClient, SyncConfig, SyncState, SyncUpdate,
};
use chrono::Utc;
use crossterm::{
    event::{
        self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, MouseButton, MouseEvent,
        MouseEventKind,
    },
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use itertools::Itertools;
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Margin, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{
        Block, BorderType, Borders, Paragraph,
        canvas::{Canvas, Circle, Line as CanvasLine, Rectangle},
    },
};
use rustls::crypto::ring::default_provider;
use serde_json::Value;
use smol_str::{SmolStr, format_smolstr};
use tokio::sync::{mpsc, watch};
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tracing::{info, warn};

// ============================================================================
// COLORS
// ============================================================================
const C_UP: Color = Color::Rgb(100, 220, 100); // Green
const C_DOWN: Color = Color::Rgb(220, 100, 100); // Red
const C_EMA: Color = Color::Rgb(100, 180, 220); // Cyan
const C_DIM: Color = Color::Rgb(120, 120, 120); // Gray
const C_BRIGHT: Color = Color::Rgb(220, 220, 220); // White
const C_WARN: Color = Color::Rgb(180, 180, 100); // Yellow
const C_DRAWING: Color = Color::Rgb(180, 130, 220); // Purple

// ============================================================================
// CONSTANTS
// ============================================================================
const TICK_RATE: Duration = Duration::from_millis(50);
const BACKFILL_BARS: usize = 300;
const PAN_STEP: i64 = 5;
const ZOOM_STEP: i64 = 10;
const NOTICE_CAP: usize = 50;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Initialize logging
///
/// Silent unless RUST_LOG opts in, so the alternate screen stays clean.
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
        )
        .with_writer(io::stderr)
        .init();
}

// ============================================================================
// ORDER GATEWAY
// ============================================================================

/// Stand-in broker used until a real adapter is wired in: accepts every
/// request and logs it.
struct AcceptAllGateway {
    next_id: AtomicU64,
}

impl AcceptAllGateway {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl OrderGateway for AcceptAllGateway {
    async fn place_order(&self, spec: OrderSpec) -> Result<PendingOrder, GatewayError> {
        let sequence = self.next_id.fetch_add(1, Ordering::Relaxed);
        let order = PendingOrder {
            order_id: format_smolstr!("ord-{:06}", sequence),
            symbol: spec.symbol,
            side: spec.side,
            price: spec.price,
            qty: spec.qty,
        };
        info!("Placed {} {} @ {}", order.side, order.symbol, order.price);
        Ok(order)
    }

    async fn modify_order(&self, request: ModifyOrder) -> Result<(), GatewayError> {
        info!("Modified {} -> {:?}", request.order_id, request.price);
        Ok(())
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), GatewayError> {
        info!("Cancelled {}", order_id);
        Ok(())
    }
}

// ============================================================================
// APP STATE
// ============================================================================

struct App {
    symbol: SmolStr,
    resolution: Resolution,
    series: CandleSeries,
    view: ViewState,
    follow: bool,
    scheduler: FrameScheduler,
    worker: GeometryWorker,
    frame: Option<GeometryFrame>,
    history: DrawingHistory,
    overlay: OrderOverlay,
    gateway: AcceptAllGateway,
    sync_buckets: SyncState,
    notices: VecDeque<(NotificationLevel, String)>,
    feed_state: ConnectionState,
    sync_state: ConnectionState,
    last_price: Option<f64>,
}

impl App {
    fn notify(&mut self, level: NotificationLevel, message: impl Into<String>) {
        self.notices.push_front((level, message.into()));
        self.notices.truncate(NOTICE_CAP);
    }

    /// Feed one live candle into the series and mark the chart dirty when
    /// anything visible changed.
    fn apply_candle(&mut self, candle: Candle) {
        match self.series.upsert_last(candle) {
            UpsertOutcome::Appended => {
                if self.follow {
                    self.view.follow_latest(self.series.len());
                }
                self.scheduler.request();
            }
            UpsertOutcome::Replaced => self.scheduler.request(),
            UpsertOutcome::Rejected => {}
        }
    }

    fn submit_geometry(&self, chart: Rect) {
        self.worker.submit(GeometryRequest {
            candles: self
                .series
                .visible_window(self.view.start_index, self.view.visible_bars),
            view: self.view,
            dims: PixelDims::new(f64::from(chart.width), f64::from(chart.height)),
            reserved_band: 0.0,
        });
    }

    fn record_drawing(&mut self, drawing: Drawing) {
        let mut drawings = self.history.present(&self.symbol).to_vec();
        drawings.push(drawing);
        self.history.record(self.symbol.clone(), drawings);
        self.scheduler.request();
    }
}

/// Channels and handles wiring the app to its background tasks.
struct Links {
    feed: FeedClient,
    sync: SyncClient,
    events: mpsc::Receiver<FeedEvent>,
    updates: mpsc::Receiver<SyncUpdate>,
    ticks: mpsc::UnboundedReceiver<()>,
    frames: watch::Receiver<Option<GeometryFrame>>,
    feed_states: mpsc::UnboundedReceiver<ConnectionState>,
    sync_states: mpsc::UnboundedReceiver<ConnectionState>,
}

fn spawn_state_forwarder(
    mut stream: WatchStream<ConnectionState>,
    tx: mpsc::UnboundedSender<ConnectionState>,
) {
    tokio::spawn(async move {
        while let Some(state) = stream.next().await {
            if tx.send(state).is_err() {
                break;
            }
        }
    });
}

// ============================================================================
// LAYOUT
// ============================================================================

struct Panes {
    status: Rect,
    chart: Rect,
    notices: Rect,
    footer: Rect,
}

fn panes(area: Rect) -> Panes {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(10),
            Constraint::Length(4),
            Constraint::Length(1),
        ])
        .split(area);
    Panes {
        status: chunks[0],
        chart: chunks[1],
        notices: chunks[2],
        footer: chunks[3],
    }
}

/// Drawable interior of the chart pane (inside the block border). Pixel
/// space, mouse mapping and the price scale all use this rect.
fn chart_inner(chart: Rect) -> Rect {
    chart.inner(Margin {
        horizontal: 1,
        vertical: 1,
    })
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = default_provider().install_default();
    init_logging();

    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen, DisableMouseCapture);
        original_hook(info);
    }));

    let symbol = SmolStr::new(env_or("CANDELA_SYMBOL", "BTCUSDT"));
    let resolution = env_or("CANDELA_RESOLUTION", "1m")
        .parse()
        .unwrap_or(Resolution::M1);
    let feed_url = env_or("CANDELA_FEED_URL", "ws://127.0.0.1:9001");
    let sync_url = env_or("CANDELA_SYNC_URL", "ws://127.0.0.1:9002");
    let history_url = env_or("CANDELA_HISTORY_URL", "http://127.0.0.1:9000");
    let data_dir = env_or("CANDELA_DATA_DIR", ".candela");

    // seed the series so the chart opens populated
    let mut series = CandleSeries::new(symbol.clone(), resolution);
    match HistoryClient::new(history_url.as_str()) {
        Ok(backfill) => match backfill
            .recent_candles(&symbol, resolution, BACKFILL_BARS)
            .await
        {
            Ok(candles) => {
                for candle in candles {
                    series.upsert_last(candle);
                }
                info!("Backfilled {} candles for {}", series.len(), symbol);
            }
            Err(error) => warn!("History backfill failed: {}", error),
        },
        Err(error) => warn!("History endpoint rejected: {}", error),
    }

    let feed = FeedClient::connect(FeedConfig::new(feed_url))?;
    let events = feed.subscribe(SubscriptionKey::candles(symbol.clone(), resolution))?;
    let (sync, updates) = SyncClient::connect(SyncConfig::new(sync_url))?;

    let worker = GeometryWorker::spawn();
    let frames = worker.frames();
    let (scheduler, ticks) = FrameScheduler::with_frame_budget();

    let (feed_states_tx, feed_states) = mpsc::unbounded_channel();
    spawn_state_forwarder(feed.state_stream(), feed_states_tx);
    let (sync_states_tx, sync_states) = mpsc::unbounded_channel();
    spawn_state_forwarder(sync.state_stream(), sync_states_tx);

    let mut view = ViewState::default();
    view.follow_latest(series.len());

    let app = App {
        symbol: symbol.clone(),
        resolution,
        series,
        view,
        follow: true,
        scheduler,
        worker,
        frame: None,
        history: DrawingHistory::load(DrawingStore::new(data_dir)),
        overlay: OrderOverlay::default(),
        gateway: AcceptAllGateway::new(),
        sync_buckets: SyncState::new(),
        notices: VecDeque::new(),
        feed_state: ConnectionState::Disconnected,
        sync_state: ConnectionState::Disconnected,
        last_price: None,
    };

    let links = Links {
        feed,
        sync,
        events,
        updates,
        ticks,
        frames,
        feed_states,
        sync_states,
    };

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, app, links).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    let _ = res;

    Ok(())
}

// ============================================================================
// EVENT LOOP
// ============================================================================

async fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    mut app: App,
    mut links: Links,
) -> io::Result<()> {
    app.scheduler.request();

    loop {
        let size = terminal.size()?;
        let layout = panes(Rect::new(0, 0, size.width, size.height));
        let chart = chart_inner(layout.chart);

        drain_feed(&mut app, &mut links);
        drain_sync(&mut app, &mut links);

        // one geometry submission per scheduler fire, however many requests
        // were coalesced behind it
        let mut ticked = false;
        while links.ticks.try_recv().is_ok() {
            ticked = true;
        }
        if ticked {
            app.submit_geometry(chart);
        }

        if links.frames.has_changed().unwrap_or(false) {
            app.frame = links.frames.borrow_and_update().clone();
        }

        terminal.draw(|f| ui(f, &app))?;

        if event::poll(TICK_RATE)? {
            match event::read()? {
                Event::Key(key) => {
                    if handle_key(key.code, &mut app, &links).await {
                        return Ok(());
                    }
                }
                Event::Mouse(mouse) => {
                    handle_mouse(mouse, &mut app, &links, chart).await;
                }
                _ => {}
            }
        }
    }
}

fn drain_feed(app: &mut App, links: &mut Links) {
    while let Ok(event) = links.events.try_recv() {
        match event.kind {
            FeedEventKind::Candle(candle) => {
                app.last_price = Some(candle.close);
                app.apply_candle(candle);
            }
            FeedEventKind::Tick { price } => app.last_price = Some(price),
        }
    }
    while let Ok(state) = links.feed_states.try_recv() {
        app.feed_state = state;
    }
}

fn drain_sync(app: &mut App, links: &mut Links) {
    while let Ok(update) = links.updates.try_recv() {
        match update {
            SyncUpdate::Notification(notification) => {
                app.notify(notification.level, notification.message);
            }
            SyncUpdate::Tick(tick) => {
                if tick.symbol == app.symbol {
                    app.last_price = Some(tick.price);
                }
            }
            SyncUpdate::Bucket { bucket, data } => {
                app.sync_buckets.apply(bucket, data);
                if bucket == StateBucket::Orders {
                    if let Some(value) = app.sync_buckets.bucket(StateBucket::Orders) {
                        app.overlay.sync_orders(orders_from_value(value));
                        app.scheduler.request();
                    }
                }
            }
        }
    }
    while let Ok(state) = links.sync_states.try_recv() {
        app.sync_state = state;
    }
}

/// The orders bucket arrives either as an array of orders or, after `_key`
/// routed updates, as an object keyed by order id.
fn orders_from_value(value: &Value) -> Vec<PendingOrder> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        Value::Object(map) => map
            .values()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        _ => Vec::new(),
    }
}

fn publish_orders(app: &App, links: &Links) {
    let orders: Vec<&PendingOrder> = app.overlay.orders().collect();
    match serde_json::to_value(&orders) {
        Ok(data) => {
            if let Err(error) = links.sync.send_update(StateBucket::Orders, data) {
                warn!("Order snapshot not queued: {}", error);
            }
        }
        Err(error) => warn!("Order snapshot unserializable: {}", error),
    }
}

/// Returns true when the app should quit.
async fn handle_key(code: KeyCode, app: &mut App, links: &Links) -> bool {
    match code {
        KeyCode::Char('q') | KeyCode::Esc => return true,
        KeyCode::Left => {
            app.follow = false;
            app.view.pan(-PAN_STEP);
            app.scheduler.request();
        }
        KeyCode::Right => {
            app.follow = false;
            app.view.pan(PAN_STEP);
            app.scheduler.request();
        }
        KeyCode::Char('+') | KeyCode::Char('=') => {
            app.view.zoom(-ZOOM_STEP);
            app.scheduler.request();
        }
        KeyCode::Char('-') => {
            app.view.zoom(ZOOM_STEP);
            app.scheduler.request();
        }
        KeyCode::Char('f') => {
            app.follow = true;
            app.view.follow_latest(app.series.len());
            app.scheduler.request();
        }
        KeyCode::Char('h') => {
            if let Some(last) = app.series.last().copied() {
                app.record_drawing(Drawing::new(
                    DrawingKind::HorizontalLine,
                    vec![DrawingPoint {
                        x: last.timestamp as f64,
                        y: last.close,
                    }],
                ));
            }
        }
        KeyCode::Char('t') => {
            let len = app.series.len();
            if len >= 2 {
                let from = app.series.get(len.saturating_sub(10)).copied();
                let to = app.series.last().copied();
                if let (Some(from), Some(to)) = (from, to) {
                    app.record_drawing(Drawing::new(
                        DrawingKind::TrendLine,
                        vec![
                            DrawingPoint {
                                x: from.timestamp as f64,
                                y: from.low,
                            },
                            DrawingPoint {
                                x: to.timestamp as f64,
                                y: to.high,
                            },
                        ],
                    ));
                }
            }
        }
        KeyCode::Char('g') => {
            let len = app.series.len();
            if len >= 2 {
                let window: Vec<Candle> = app
                    .series
                    .iter()
                    .skip(len.saturating_sub(20))
                    .copied()
                    .collect();
                let low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
                let high = window
                    .iter()
                    .map(|c| c.high)
                    .fold(f64::NEG_INFINITY, f64::max);
                let first = window[0];
                let last = window[window.len() - 1];
                app.record_drawing(Drawing::new(
                    DrawingKind::Fibonacci,
                    vec![
                        DrawingPoint {
                            x: first.timestamp as f64,
                            y: low,
                        },
                        DrawingPoint {
                            x: last.timestamp as f64,
                            y: high,
                        },
                    ],
                ));
            }
        }
        KeyCode::Char('c') => {
            if let Some(last) = app.series.last().copied() {
                app.record_drawing(Drawing::new(
                    DrawingKind::Circle,
                    vec![
                        DrawingPoint {
                            x: last.timestamp as f64,
                            y: last.close,
                        },
                        DrawingPoint {
                            x: last.timestamp as f64,
                            y: last.high,
                        },
                    ],
                ));
            }
        }
        KeyCode::Char('x') => {
            app.history.record(app.symbol.clone(), Vec::new());
            app.scheduler.request();
        }
        KeyCode::Char('u') => {
            if app.history.undo(&app.symbol) {
                app.scheduler.request();
            }
        }
        KeyCode::Char('y') => {
            if app.history.redo(&app.symbol) {
                app.scheduler.request();
            }
        }
        KeyCode::Char('b') | KeyCode::Char('s') => {
            let side = if code == KeyCode::Char('b') {
                Side::Buy
            } else {
                Side::Sell
            };
            place_demo_order(app, links, side).await;
        }
        KeyCode::Char('r') => {
            let _ = links.feed.reconnect();
            let _ = links.sync.reconnect();
            app.notify(NotificationLevel::Info, "Reconnect requested");
        }
        _ => {}
    }
    false
}

/// Place a resting order a little away from the last price, so the marker
/// is visible and draggable immediately.
async fn place_demo_order(app: &mut App, links: &Links, side: Side) {
    let Some(last) = app.last_price.or_else(|| app.series.last().map(|c| c.close)) else {
        app.notify(NotificationLevel::Warning, "No price yet, order skipped");
        return;
    };
    let price = match side {
        Side::Buy => last * 0.995,
        Side::Sell => last * 1.005,
    };
    let spec = OrderSpec {
        symbol: app.symbol.clone(),
        side,
        price,
        qty: 0.01,
    };
    match app.gateway.place_order(spec).await {
        Ok(order) => {
            app.notify(
                NotificationLevel::Info,
                format!("Order {} placed @ {:.2}", order.order_id, order.price),
            );
            app.overlay.upsert_order(order);
            publish_orders(app, links);
            app.scheduler.request();
        }
        Err(error) => {
            app.notify(NotificationLevel::Error, format!("Place failed: {}", error));
        }
    }
}

async fn handle_mouse(mouse: MouseEvent, app: &mut App, links: &Links, chart: Rect) {
    let Some(frame) = app.frame.clone() else {
        return;
    };
    let right_edge = f64::from(chart.width);
    let px = f64::from(mouse.column.saturating_sub(chart.x));
    let py = f64::from(mouse.row.saturating_sub(chart.y));

    match mouse.kind {
        MouseEventKind::Down(MouseButton::Left) => {
            match app.overlay.hit_test(px, py, right_edge, &frame.scale) {
                Some(OverlayHit::Cancel(order_id)) => {
                    match app.overlay.cancel(&order_id, &app.gateway).await {
                        Ok(()) => {
                            app.notify(
                                NotificationLevel::Info,
                                format!("Order {} cancelled", order_id),
                            );
                            publish_orders(app, links);
                        }
                        Err(error) => {
                            app.notify(
                                NotificationLevel::Error,
                                format!("Cancel failed: {}", error),
                            );
                        }
                    }
                    app.scheduler.request();
                }
                Some(OverlayHit::Body(order_id)) => {
                    if app.overlay.drag_start(&order_id) {
                        app.scheduler.request();
                    }
                }
                None => {}
            }
        }
        MouseEventKind::Drag(MouseButton::Left) => {
            app.overlay.drag(py, &frame.scale);
            app.scheduler.request();
        }
        MouseEventKind::Up(MouseButton::Left) => {
            if let Some(outcome) = app.overlay.drag_end(&app.gateway).await {
                match outcome {
                    candela_chart::DragOutcome::Committed { order_id, price } => {
                        app.notify(
                            NotificationLevel::Info,
                            format!("Order {} repriced @ {:.2}", order_id, price),
                        );
                        publish_orders(app, links);
                    }
                    candela_chart::DragOutcome::RolledBack {
                        order_id, reason, ..
                    } => {
                        app.notify(
                            NotificationLevel::Warning,
                            format!("Order {} kept: {:?}", order_id, reason),
                        );
                    }
                }
                app.scheduler.request();
            }
        }
        MouseEventKind::ScrollUp => {
            app.view.zoom(-ZOOM_STEP / 2);
            app.scheduler.request();
        }
        MouseEventKind::ScrollDown => {
            app.view.zoom(ZOOM_STEP / 2);
            app.scheduler.request();
        }
        _ => {}
    }
}

// ============================================================================
// RENDERING
// ============================================================================

fn ui(f: &mut Frame, app: &App) {
    let layout = panes(f.area());
    render_status(f, layout.status, app);
    render_chart(f, layout.chart, app);
    render_notices(f, layout.notices, app);
    render_footer(f, layout.footer);
}

fn state_indicator(state: ConnectionState) -> (&'static str, Color) {
    match state {
        ConnectionState::Open => ("●", C_UP),
        ConnectionState::Connecting => ("◐", C_WARN),
        ConnectionState::Closed | ConnectionState::Errored | ConnectionState::Disconnected => {
            ("○", C_DOWN)
        }
    }
}

fn render_status(f: &mut Frame, area: Rect, app: &App) {
    let (feed_symbol, feed_color) = state_indicator(app.feed_state);
    let (sync_symbol, sync_color) = state_indicator(app.sync_state);

    let price = app
        .last_price
        .map(|p| format!("{:.2}", p))
        .unwrap_or_else(|| "-".to_string());

    let line = Line::from(vec![
        Span::styled(
            format!(" {} · {} ", app.symbol, app.resolution.as_str()),
            Style::default().fg(C_BRIGHT).add_modifier(Modifier::BOLD),
        ),
        Span::styled(format!(" {} ", price), Style::default().fg(C_EMA)),
        Span::styled(
            format!(" FEED {} {} ", feed_symbol, app.feed_state),
            Style::default().fg(feed_color),
        ),
        Span::styled(
            format!(" SYNC {} {} ", sync_symbol, app.sync_state),
            Style::default().fg(sync_color),
        ),
        Span::styled(
            format!(" ⏱ {} ", Utc::now().format("%H:%M:%S")),
            Style::default().fg(C_DIM),
        ),
    ]);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(C_DIM));

    f.render_widget(
        Paragraph::new(line).block(block).alignment(Alignment::Center),
        area,
    );
}

fn render_chart(f: &mut Frame, area: Rect, app: &App) {
    let inner = chart_inner(area);
    let width = f64::from(inner.width);
    let height = f64::from(inner.height);

    let title = if app.follow { " live " } else { " detached " };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(C_DIM))
        .title(Span::styled(title, Style::default().fg(C_DIM)));

    let canvas = Canvas::default()
        .block(block)
        .marker(symbols::Marker::Braille)
        .x_bounds([0.0, width.max(1.0)])
        .y_bounds([0.0, height.max(1.0)])
        .paint(|ctx| {
            let Some(frame) = &app.frame else {
                return;
            };

            // candles: wick line + body rectangle, y flipped into canvas space
            for candle in &frame.candles {
                let color = match candle.color {
                    CandleColor::Up => C_UP,
                    CandleColor::Down => C_DOWN,
                };
                ctx.draw(&CanvasLine {
                    x1: candle.x,
                    y1: height - candle.wick_top,
                    x2: candle.x,
                    y2: height - candle.wick_bottom,
                    color,
                });
                let half = (frame.slot_width * 0.35).max(0.25);
                ctx.draw(&Rectangle {
                    x: candle.x - half,
                    y: height - candle.body_bottom,
                    width: half * 2.0,
                    height: (candle.body_bottom - candle.body_top).max(0.1),
                    color,
                });
            }

            // EMA polyline
            for ((x1, y1), (x2, y2)) in frame.ema.iter().tuple_windows() {
                ctx.draw(&CanvasLine {
                    x1: *x1,
                    y1: height - *y1,
                    x2: *x2,
                    y2: height - *y2,
                    color: C_EMA,
                });
            }

            // drawings, converted into the current window's index space
            let drawings = to_index_space(app.history.present(&app.symbol), &app.series);
            for drawing in &drawings {
                paint_drawing(ctx, drawing, frame, &app.view, width, height);
            }

            // last price marker
            if let Some(price) = app.last_price {
                let y = height - frame.scale.price_to_y(price);
                ctx.draw(&CanvasLine {
                    x1: 0.0,
                    y1: y,
                    x2: width,
                    y2: y,
                    color: C_DIM,
                });
            }

            // order markers; the dragged order renders on top at its live
            // price
            let mut markers = app.overlay.markers(width, &frame.scale);
            markers.extend(app.overlay.drag_marker(width, &frame.scale));
            for marker in &markers {
                let color = if marker.dragging {
                    C_WARN
                } else if marker.side.is_buy() {
                    C_UP
                } else {
                    C_DOWN
                };
                ctx.draw(&Rectangle {
                    x: marker.x,
                    y: height - (marker.y + marker.height / 2.0),
                    width: marker.width,
                    height: marker.height,
                    color,
                });
                ctx.draw(&Circle {
                    x: marker.cancel_x,
                    y: height - marker.cancel_y,
                    radius: marker.cancel_radius,
                    color: C_DIM,
                });
            }
        });

    f.render_widget(canvas, area);
}

/// Canvas x of an absolute data-index inside the current window.
///
/// Drawing points carry absolute series indices after `to_index_space`,
/// while the geometry pass numbers candles within the visible slice, so the
/// window origin is subtracted here to land drawings on the same slots as
/// their candles. Collapses to `(index - start_index + 0.5) * slot_width`
/// whether the viewport is panned left of the data or scrolled into it.
fn index_to_canvas_x(index: f64, view: &ViewState, slot_width: f64) -> f64 {
    (index - view.start_index as f64 + 0.5) * slot_width
}

fn paint_drawing(
    ctx: &mut ratatui::widgets::canvas::Context<'_>,
    drawing: &Drawing,
    frame: &GeometryFrame,
    view: &ViewState,
    width: f64,
    height: f64,
) {
    let color = hex_color(&drawing.style.color);
    let to_px = |point: &DrawingPoint| -> (f64, f64) {
        (
            index_to_canvas_x(point.x, view, frame.slot_width),
            height - frame.scale.price_to_y(point.y),
        )
    };

    match drawing.kind {
        DrawingKind::TrendLine => {
            if let (Some(a), Some(b)) = (drawing.points.first(), drawing.points.get(1)) {
                let (x1, y1) = to_px(a);
                let (x2, y2) = to_px(b);
                ctx.draw(&CanvasLine {
                    x1,
                    y1,
                    x2,
                    y2,
                    color,
                });
            }
        }
        DrawingKind::HorizontalLine => {
            if let Some(point) = drawing.points.first() {
                let (_, y) = to_px(point);
                ctx.draw(&CanvasLine {
                    x1: 0.0,
                    y1: y,
                    x2: width,
                    y2: y,
                    color,
                });
            }
        }
        DrawingKind::Fibonacci => {
            if let (Some(a), Some(b)) = (drawing.points.first(), drawing.points.get(1)) {
                for (_, price) in fibonacci_levels(a.y, b.y) {
                    let y = height - frame.scale.price_to_y(price);
                    ctx.draw(&CanvasLine {
                        x1: 0.0,
                        y1: y,
                        x2: width,
                        y2: y,
                        color,
                    });
                }
            }
        }
        DrawingKind::Circle => {
            if let (Some(center), Some(edge)) = (drawing.points.first(), drawing.points.get(1)) {
                let (cx, cy) = to_px(center);
                let (ex, ey) = to_px(edge);
                let radius = ((ex - cx).powi(2) + (ey - cy).powi(2)).sqrt().max(0.5);
                ctx.draw(&Circle {
                    x: cx,
                    y: cy,
                    radius,
                    color,
                });
            }
        }
    }
}

fn hex_color(hex: &str) -> Color {
    let hex = hex.trim_start_matches('#');
    if hex.len() == 6 && hex.is_ascii() {
        let channels = (
            u8::from_str_radix(&hex[0..2], 16),
            u8::from_str_radix(&hex[2..4], 16),
            u8::from_str_radix(&hex[4..6], 16),
        );
        if let (Ok(r), Ok(g), Ok(b)) = channels {
            return Color::Rgb(r, g, b);
        }
    }
    C_DRAWING
}

fn render_notices(f: &mut Frame, area: Rect, app: &App) {
    let lines: Vec<Line> = app
        .notices
        .iter()
        .take(area.height.saturating_sub(2) as usize)
        .map(|(level, message)| {
            let color = match level {
                NotificationLevel::Info => C_DIM,
                NotificationLevel::Warning => C_WARN,
                NotificationLevel::Error => C_DOWN,
            };
            Line::from(Span::styled(message.clone(), Style::default().fg(color)))
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(C_DIM))
        .title(Span::styled(" notices ", Style::default().fg(C_DIM)));

    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_footer(f: &mut Frame, area: Rect) {
    let help = Line::from(vec![
        Span::styled(" [Q]uit ", Style::default().fg(C_DIM)),
        Span::styled("[←→] Pan ", Style::default().fg(C_DIM)),
        Span::styled("[+/-] Zoom ", Style::default().fg(C_DIM)),
        Span::styled("[F]ollow ", Style::default().fg(C_DIM)),
        Span::styled("[H/T/G/C] Draw ", Style::default().fg(C_DIM)),
        Span::styled("[X] Clear ", Style::default().fg(C_DIM)),
        Span::styled("[U]ndo [Y] Redo ", Style::default().fg(C_DIM)),
        Span::styled("[B/S] Order ", Style::default().fg(C_DIM)),
        Span::styled("[R]econnect ", Style::default().fg(C_DIM)),
        Span::styled("drag orders with the mouse", Style::default().fg(C_DIM)),
    ]);
    f.render_widget(Paragraph::new(help).alignment(Alignment::Center), area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use candela_chart::render::geometry::compute_frame;
    use candela_chart::render::geometry::EmaCache;

    const EPS: f64 = 1e-9;

    fn candle(timestamp: i64, close: f64) -> Candle {
        Candle {
            timestamp,
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_drawing_x_aligns_with_candle_slots_when_scrolled() {
        // 300 candles backfilled, 120 visible, following the tail: the
        // window origin sits at 180 and drawings carry absolute indices
        let mut series = CandleSeries::new("BTCUSDT", Resolution::M1);
        for i in 0..300 {
            series.upsert_last(candle(i * 60_000, 100.0));
        }
        let mut view = ViewState {
            visible_bars: 120,
            ..ViewState::default()
        };
        view.follow_latest(series.len());
        assert_eq!(view.start_index, 180);

        let request = GeometryRequest {
            candles: series.visible_window(view.start_index, view.visible_bars),
            view,
            dims: PixelDims::new(600.0, 300.0),
            reserved_band: 0.0,
        };
        let frame = compute_frame(&request, &mut EmaCache::default()).unwrap();

        // a drawing anchored on the last candle (absolute index 299) must
        // land on the same x the geometry pass gave that candle
        let drawing_x = index_to_canvas_x(299.0, &view, frame.slot_width);
        let candle_x = frame.candles.last().unwrap().x;
        assert!(
            (drawing_x - candle_x).abs() < EPS,
            "drawing at {drawing_x}, candle at {candle_x}"
        );
        // and stay inside the canvas
        assert!(drawing_x < 600.0);

        // first visible candle (absolute index 180) aligns too
        let first_x = index_to_canvas_x(180.0, &view, frame.slot_width);
        assert!((first_x - frame.candles[0].x).abs() < EPS);
    }

    #[test]
    fn test_drawing_x_matches_lead_gap_when_panned_left() {
        let mut series = CandleSeries::new("BTCUSDT", Resolution::M1);
        series.upsert_last(candle(0, 100.0));
        let view = ViewState {
            start_index: -2,
            visible_bars: 4,
            ..ViewState::default()
        };

        let request = GeometryRequest {
            candles: series.visible_window(view.start_index, view.visible_bars),
            view,
            dims: PixelDims::new(400.0, 300.0),
            reserved_band: 0.0,
        };
        let frame = compute_frame(&request, &mut EmaCache::default()).unwrap();

        // the single candle sits two empty slots in; so does its drawing
        let drawing_x = index_to_canvas_x(0.0, &view, frame.slot_width);
        assert!((drawing_x - frame.candles[0].x).abs() < EPS);
        assert!((drawing_x - 250.0).abs() < EPS);
    }
}
