//! Device Controller
//!
//! Accepts high-level intents, turns them into frames and hands those to the
//! per-device [`CommandScheduler`]. Also owns the connection lifecycle and the
//! believed device state.
//!
//! ```text
//! intent --> [DeviceController] --frames--> [CommandScheduler] --write--> [Transport]
//!                 |      ^                          |                          |
//!                 |      +------ SchedulerEvent -----+                          |
//!                 |      +------ notifications / disconnect --------------------+
//!                 v
//!          ControllerEvent --> host
//! ```
//!
//! State, pixel buffer and frame counter live behind one mutex that is never
//! held across an `.await`.

use crate::domain::effects::{self, Effect, EffectKind};
use crate::domain::frame_buffer::{FrameCounter, FrameNumberOverflow, PixelFrameBuffer};
use crate::domain::models::{
    BatchId, Color, CommandId, CommandStatus, CommandTicket, ConnectionStatus, ControllerEvent,
    DeviceState, IntentStatus, LightMode, MessageSeverity, MusicSettings, PixelUpdate,
    StatusMessage,
};
use crate::domain::settings::{BrightnessStrategy, Settings};
use crate::error::{ControllerError, Result};
use crate::infrastructure::bluetooth::chunker::{self, WriteLimit};
use crate::infrastructure::bluetooth::connection::{BleConnection, ConnectionConfig, ConnectionResult};
use crate::infrastructure::bluetooth::protocol::{
    self, Command, DiyMode, DiySettings, FrameState,
};
use crate::infrastructure::bluetooth::scheduler::{
    CommandScheduler, FrameKind, SchedulerConfig, SchedulerEvent,
};
use crate::infrastructure::bluetooth::transport::{DeviceHandle, SharedTransport, TransportEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything the controller can be tuned with
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Pixel count assumed until the variant is resolved
    pub default_pixel_count: u16,
    /// Use this ATT MTU instead of the negotiated one
    pub mtu_override: Option<u16>,
    /// Pixels per frame when no MTU is known
    pub default_chunk_pixels: usize,
    pub scheduler: SchedulerConfig,
    pub connection: ConnectionConfig,
    pub frame_number_limit: u8,
    pub frame_number_overflow: FrameNumberOverflow,
    pub brightness_strategy: BrightnessStrategy,
    /// Playback speed of rendered animations (0-100)
    pub effect_speed: u8,
    pub effect_direction: u8,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_pixel_count: protocol::DEFAULT_PIXEL_COUNT,
            mtu_override: None,
            default_chunk_pixels: protocol::DEFAULT_CHUNK_PIXELS,
            scheduler: SchedulerConfig::default(),
            connection: ConnectionConfig::default(),
            frame_number_limit: u8::MAX,
            frame_number_overflow: FrameNumberOverflow::Wrap,
            brightness_strategy: BrightnessStrategy::DiySettings,
            effect_speed: protocol::DEFAULT_SPEED,
            effect_direction: 0,
        }
    }
}

impl From<&Settings> for ControllerConfig {
    fn from(s: &Settings) -> Self {
        Self {
            default_pixel_count: s.default_pixel_count,
            mtu_override: s.mtu_override,
            default_chunk_pixels: s.default_chunk_pixels,
            scheduler: SchedulerConfig {
                mode_delay: Duration::from_millis(s.mode_delay_ms),
                pixel_delay: Duration::from_millis(s.pixel_delay_ms),
                max_retries: s.max_retries,
                retry_backoff: Duration::from_millis(s.retry_backoff_ms),
                write_timeout: Duration::from_millis(s.write_timeout_ms),
            },
            connection: ConnectionConfig {
                max_connect_attempts: s.connect_max_attempts,
                connect_retry_delay_ms: s.connect_retry_delay_ms,
                service_uuid: s.ble_service_uuid.clone(),
                write_char_uuid: s.ble_write_char_uuid.clone(),
                notify_char_uuid: s.ble_notify_char_uuid.clone(),
                ..ConnectionConfig::default()
            },
            frame_number_limit: s.frame_number_limit,
            frame_number_overflow: s.frame_number_overflow,
            brightness_strategy: s.brightness_strategy,
            effect_speed: s.effect_speed,
            effect_direction: s.effect_direction,
        }
    }
}

/// One frame of an intent, not yet queued
struct Outgoing {
    frame: Vec<u8>,
    kind: FrameKind,
    /// Pixels acknowledged into the buffer once the frame is written
    pixels: Option<Vec<PixelUpdate>>,
}

/// Frames of one intent, fully encoded before anything is queued
#[derive(Default)]
struct Plan {
    frames: Vec<Outgoing>,
}

impl Plan {
    fn command(&mut self, command: Command) -> Result<()> {
        let kind = if command.is_pixel_batch() {
            FrameKind::Pixels
        } else {
            FrameKind::Mode
        };
        self.frames.push(Outgoing {
            frame: command.encode()?,
            kind,
            pixels: None,
        });
        Ok(())
    }

    /// Pixel frames whose contents are tracked in the frame buffer
    fn buffered_pixels(
        &mut self,
        frame_number: u8,
        pixels: &[PixelUpdate],
        pixel_count: u16,
        limit: WriteLimit,
    ) -> Result<()> {
        for chunk in chunker::chunk_pixels(pixels, limit)? {
            self.frames.push(Outgoing {
                frame: protocol::build_pixel_frame(frame_number, chunk, pixel_count)?,
                kind: FrameKind::Pixels,
                pixels: Some(chunk.to_vec()),
            });
        }
        Ok(())
    }

    /// Animation pixel frames; these never touch the frame buffer
    fn animation_pixels(
        &mut self,
        frame_number: u8,
        pixels: &[PixelUpdate],
        pixel_count: u16,
        limit: WriteLimit,
    ) -> Result<()> {
        for frame in chunker::encode_chunks(frame_number, pixels, pixel_count, limit)? {
            self.frames.push(Outgoing {
                frame,
                kind: FrameKind::Pixels,
                pixels: None,
            });
        }
        Ok(())
    }
}

struct Inner {
    status: ConnectionStatus,
    state: DeviceState,
    buffer: PixelFrameBuffer,
    frame_counter: FrameCounter,
    handle: Option<DeviceHandle>,
    /// Set once an advertised name has fixed the pixel count
    variant_resolved: bool,
    /// Brightness the device was last told, `None` when unknown
    sent_brightness: Option<u8>,
    /// Batch of the effect currently being streamed
    active_effect: Option<BatchId>,
    /// Queued pixel frames and the pixels they carry
    in_transit: HashMap<CommandId, Vec<PixelUpdate>>,
    link_task: Option<JoinHandle<()>>,
}

struct Shared {
    transport: SharedTransport,
    config: ControllerConfig,
    scheduler: CommandScheduler,
    inner: Mutex<Inner>,
    event_sender: mpsc::UnboundedSender<ControllerEvent>,
    scheduler_events: Mutex<Option<mpsc::UnboundedReceiver<SchedulerEvent>>>,
}

/// Controls one curtain light over an injected [`Transport`](crate::Transport)
pub struct DeviceController {
    shared: Arc<Shared>,
}

impl DeviceController {
    pub fn new(
        transport: SharedTransport,
        config: ControllerConfig,
        event_sender: mpsc::UnboundedSender<ControllerEvent>,
    ) -> Self {
        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let scheduler = CommandScheduler::new(config.scheduler.clone(), scheduler_tx);
        let inner = Inner {
            status: ConnectionStatus::Disconnected,
            state: DeviceState::new(config.default_pixel_count),
            buffer: PixelFrameBuffer::new(config.default_pixel_count),
            frame_counter: FrameCounter::new(config.frame_number_limit, config.frame_number_overflow),
            handle: None,
            variant_resolved: false,
            sent_brightness: None,
            active_effect: None,
            in_transit: HashMap::new(),
            link_task: None,
        };

        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                scheduler,
                inner: Mutex::new(inner),
                event_sender,
                scheduler_events: Mutex::new(Some(scheduler_rx)),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Connect, resolve the device variant and start dispatching
    ///
    /// When the link comes back after a drop and the light was on, the full
    /// last-known state is queued again.
    pub async fn connect(&self, address: &str) -> Result<()> {
        if self.connection_status() != ConnectionStatus::Disconnected {
            self.disconnect().await;
        }
        self.shared.set_status(ConnectionStatus::Connecting);

        let connection = BleConnection::new(
            Arc::clone(&self.shared.transport),
            self.shared.event_sender.clone(),
            self.shared.config.connection.clone(),
        );
        let ConnectionResult { handle, events } = match connection.connect(address).await {
            Ok(result) => result,
            Err(e) => {
                error!("Connection to {} failed: {}", address, e);
                self.shared.set_status(ConnectionStatus::Disconnected);
                return Err(e.into());
            }
        };
        self.shared.set_status(ConnectionStatus::Connected);
        self.spawn_scheduler_listener();

        if let Some(name) = handle.name.as_deref() {
            if !protocol::is_supported_device_name(name) {
                warn!("{:?} does not advertise as a Hello Fairy light", name);
            }
        }
        let (pixel_count, warning) = protocol::detect_pixel_count(handle.name.as_deref());
        if let Some(warning) = warning {
            self.shared.send_log(&warning.to_string(), MessageSeverity::Warning);
        }

        let state = {
            let mut inner = self.shared.inner.lock();
            if inner.buffer.pixel_count() != pixel_count {
                info!("Device has {} pixels", pixel_count);
                inner.buffer.resize(pixel_count);
                inner.state.pixel_count = pixel_count;
            }
            inner.variant_resolved = true;
            inner.sent_brightness = None;
            inner.handle = Some(handle.clone());
            inner.status = ConnectionStatus::Ready;
            inner.link_task = Some(tokio::spawn(link_listener(
                Arc::downgrade(&self.shared),
                events,
            )));

            if inner.buffer.is_stale() && inner.state.is_on() {
                self.shared.restore(&mut inner);
            }
            inner.buffer.mark_fresh();
            inner.state
        };

        self.shared
            .scheduler
            .start(Arc::clone(&self.shared.transport), handle);

        self.shared.emit(ControllerEvent::ConnectionStatus(ConnectionStatus::Ready));
        self.shared.emit(ControllerEvent::StateChanged(state));
        self.shared.send_log(
            &format!("Curtain light ready ({} pixels)", pixel_count),
            MessageSeverity::Success,
        );
        Ok(())
    }

    /// Drop the link; pixel state is kept for the next connection
    pub async fn disconnect(&self) {
        let handle = self.shared.inner.lock().handle.clone();
        self.shared.handle_disconnect("disconnect requested");
        if let Some(handle) = handle {
            if let Err(e) = self.shared.transport.disconnect(&handle).await {
                warn!("Transport disconnect failed: {}", e);
            }
        }
    }

    fn spawn_scheduler_listener(&self) {
        let Some(mut events) = self.shared.scheduler_events.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.on_scheduler_event(event);
            }
        });
    }

    // ------------------------------------------------------------------
    // Intents
    // ------------------------------------------------------------------

    /// Switch back on with the last solid color and brightness
    pub fn turn_on(&self) -> Result<CommandTicket> {
        let (color, brightness) = {
            let inner = self.shared.inner.lock();
            (inner.state.color, inner.state.brightness)
        };
        self.set_color(color, brightness)
    }

    /// Switch off, flushing everything still queued
    pub fn turn_off(&self) -> Result<CommandTicket> {
        let mut inner = self.shared.inner.lock();
        Shared::ensure_ready(&inner)?;
        let frame = Command::mode(DiyMode::StaticOff).encode()?;

        inner.active_effect = None;
        let batch = self.shared.scheduler.next_batch();
        let commands = self
            .shared
            .scheduler
            .interrupt(batch, vec![(frame, FrameKind::Mode)]);

        inner.state.mode = LightMode::Off;
        info!("Light off");
        self.shared.emit(ControllerEvent::StateChanged(inner.state));
        Ok(CommandTicket { batch, commands })
    }

    /// Show one solid color on every pixel
    pub fn set_color(&self, color: Color, brightness: u8) -> Result<CommandTicket> {
        if brightness == 0 {
            return self.turn_off();
        }

        let mut inner = self.shared.inner.lock();
        Shared::ensure_ready(&inner)?;
        let limit = self.shared.write_limit(&inner)?;
        let plan = self.shared.plan_static(&mut inner, color, brightness, limit)?;

        self.shared.supersede_effect(&mut inner);
        inner.state.mode = LightMode::Static { color };
        inner.state.color = color;
        inner.state.brightness = brightness;
        let ticket = self.shared.submit(&mut inner, plan);

        info!("Color {} at brightness {} ({} frames)", color, brightness, ticket.len());
        self.shared.emit(ControllerEvent::StateChanged(inner.state));
        Ok(ticket)
    }

    /// Change brightness; zero switches the light off
    pub fn set_brightness(&self, brightness: u8) -> Result<CommandTicket> {
        if brightness == 0 {
            return self.turn_off();
        }

        let mut inner = self.shared.inner.lock();
        Shared::ensure_ready(&inner)?;
        let limit = self.shared.write_limit(&inner)?;
        let scale_pixels = self.shared.config.brightness_strategy == BrightnessStrategy::ScalePixels;

        let mut plan = Plan::default();
        let mode = inner.state.mode;
        match mode {
            LightMode::Off => {
                let color = inner.state.color;
                plan = self.shared.plan_static(&mut inner, color, brightness, limit)?;
                inner.state.mode = LightMode::Static { color };
            }
            LightMode::Static { color } if scale_pixels => {
                plan = self.shared.plan_static(&mut inner, color, brightness, limit)?;
            }
            LightMode::Effect { effect_id } => match effects::find_by_id(effect_id) {
                Some(effect) if matches!(effect.kind, EffectKind::Scene { .. }) || scale_pixels => {
                    inner.state.brightness = brightness;
                    plan = self.shared.plan_effect(&mut inner, effect, limit)?;
                    self.shared.supersede_effect(&mut inner);
                }
                _ => self.shared.plan_brightness(&mut inner, &mut plan, brightness)?,
            },
            _ => self.shared.plan_brightness(&mut inner, &mut plan, brightness)?,
        }

        inner.state.brightness = brightness;
        let ticket = self.shared.submit(&mut inner, plan);
        if matches!(inner.state.mode, LightMode::Effect { .. }) && inner.active_effect.is_none() {
            inner.active_effect = Some(ticket.batch);
        }

        debug!("Brightness {} ({} frames)", brightness, ticket.len());
        self.shared.emit(ControllerEvent::StateChanged(inner.state));
        Ok(ticket)
    }

    /// Address pixels individually; only pixels the device does not already
    /// show are sent
    pub fn set_pixels(&self, updates: &[PixelUpdate]) -> Result<CommandTicket> {
        let mut inner = self.shared.inner.lock();
        Shared::ensure_ready(&inner)?;
        let limit = self.shared.write_limit(&inner)?;

        let pending = Shared::queued_pixels(&inner);
        let needed = inner.buffer.apply(updates, &pending)?;
        let mut plan = Plan::default();
        let mode = inner.state.mode;
        match mode {
            LightMode::Static { .. } | LightMode::Dynamic => {
                self.shared.plan_pixels(&mut inner, &mut plan, &needed, limit)?;
            }
            _ => {
                // The light shows something else: switch to static display
                // and send the whole picture
                let full = inner.buffer.full_state();
                let brightness = inner.state.brightness;
                plan.command(Command::mode(DiyMode::ShowStatic))?;
                self.shared.plan_pixels(&mut inner, &mut plan, &full, limit)?;
                self.shared.plan_brightness(&mut inner, &mut plan, brightness)?;
            }
        }

        self.shared.supersede_effect(&mut inner);
        inner.state.mode = LightMode::Dynamic;
        let ticket = self.shared.submit(&mut inner, plan);

        debug!("{} pixel update(s) requested, {} frame(s) queued", updates.len(), ticket.len());
        self.shared.emit(ControllerEvent::StateChanged(inner.state));
        Ok(ticket)
    }

    pub fn set_pixel(&self, index: u16, color: Color) -> Result<CommandTicket> {
        self.set_pixels(&[(index, color)])
    }

    /// Play a catalog effect by name
    pub fn select_effect(&self, name: &str) -> Result<CommandTicket> {
        let effect = effects::find_by_name(name)
            .ok_or_else(|| ControllerError::UnknownEffect(name.to_string()))?;
        self.play_effect(effect)
    }

    /// Play a catalog effect by id
    pub fn select_effect_id(&self, id: u8) -> Result<CommandTicket> {
        let effect =
            effects::find_by_id(id).ok_or_else(|| ControllerError::UnknownEffect(id.to_string()))?;
        self.play_effect(effect)
    }

    fn play_effect(&self, effect: &'static Effect) -> Result<CommandTicket> {
        let mut inner = self.shared.inner.lock();
        Shared::ensure_ready(&inner)?;
        let limit = self.shared.write_limit(&inner)?;
        let plan = self.shared.plan_effect(&mut inner, effect, limit)?;

        self.shared.supersede_effect(&mut inner);
        inner.state.mode = LightMode::Effect {
            effect_id: effect.id,
        };
        let ticket = self.shared.submit(&mut inner, plan);
        inner.active_effect = Some(ticket.batch);

        info!("Effect '{}' ({} frames)", effect.name, ticket.len());
        self.shared.emit(ControllerEvent::StateChanged(inner.state));
        Ok(ticket)
    }

    pub fn set_music_mode(&self, settings: MusicSettings) -> Result<CommandTicket> {
        let mut inner = self.shared.inner.lock();
        Shared::ensure_ready(&inner)?;
        let mut plan = Plan::default();
        plan.command(Command::SetMusicMode(settings))?;

        self.shared.supersede_effect(&mut inner);
        inner.state.mode = LightMode::Music(settings);
        let ticket = self.shared.submit(&mut inner, plan);

        info!("Music mode {} (sensitivity {})", settings.mode, settings.sensitivity);
        self.shared.emit(ControllerEvent::StateChanged(inner.state));
        Ok(ticket)
    }

    /// Ask the device to keep what it shows across power cycles
    pub fn save_state(&self) -> Result<CommandTicket> {
        let mut inner = self.shared.inner.lock();
        Shared::ensure_ready(&inner)?;
        let mut plan = Plan::default();
        plan.command(Command::mode(DiyMode::Save))?;
        Ok(self.shared.submit(&mut inner, plan))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn state(&self) -> DeviceState {
        self.shared.inner.lock().state
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.inner.lock().status
    }

    /// Desired color of every pixel, in display order
    pub fn pixels(&self) -> Vec<PixelUpdate> {
        self.shared.inner.lock().buffer.full_state()
    }

    /// Frames waiting for the scheduler, front first
    pub fn queued_frames(&self) -> Vec<Vec<u8>> {
        self.shared.scheduler.pending_frames()
    }

    /// Aggregate outcome of an intent
    pub fn ticket_status(&self, ticket: &CommandTicket) -> IntentStatus {
        let mut queued = false;
        let mut cancelled = false;
        for id in &ticket.commands {
            match self.shared.scheduler.status(*id) {
                Some(CommandStatus::Failed(e)) => return IntentStatus::Failed(e),
                Some(CommandStatus::Cancelled) => cancelled = true,
                Some(status) if !status.is_finished() => queued = true,
                // Acknowledged, or pruned from the history long ago
                _ => {}
            }
        }
        if queued {
            IntentStatus::Queued
        } else if cancelled {
            IntentStatus::Cancelled
        } else {
            IntentStatus::Applied
        }
    }
}

impl Drop for DeviceController {
    fn drop(&mut self) {
        if let Some(task) = self.shared.inner.lock().link_task.take() {
            task.abort();
        }
    }
}

impl Shared {
    fn emit(&self, event: ControllerEvent) {
        let _ = self.event_sender.send(event);
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        self.emit(ControllerEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.inner.lock().status = status;
        self.emit(ControllerEvent::ConnectionStatus(status));
    }

    fn ensure_ready(inner: &Inner) -> Result<()> {
        match inner.status {
            ConnectionStatus::Ready => Ok(()),
            _ if !inner.variant_resolved => Err(ControllerError::NotReady),
            _ => Err(ControllerError::Disconnected),
        }
    }

    fn write_limit(&self, inner: &Inner) -> Result<WriteLimit> {
        let mtu = self
            .config
            .mtu_override
            .or_else(|| inner.handle.as_ref().and_then(|h| h.mtu));
        let limit = WriteLimit::from_mtu(mtu, self.config.default_chunk_pixels);
        limit.pixels_per_chunk()?;
        Ok(limit)
    }

    /// Cancel whatever is left of a playing effect
    fn supersede_effect(&self, inner: &mut Inner) {
        if let Some(batch) = inner.active_effect.take() {
            let cancelled = self.scheduler.cancel_batch(batch);
            if cancelled > 0 {
                debug!("Superseded effect, {} frame(s) dropped", cancelled);
            }
        }
    }

    /// Pixels still waiting in the queue, oldest first
    fn queued_pixels(inner: &Inner) -> Vec<PixelUpdate> {
        let mut ids: Vec<&CommandId> = inner.in_transit.keys().collect();
        ids.sort();
        ids.into_iter()
            .flat_map(|id| inner.in_transit[id].iter().copied())
            .collect()
    }

    fn submit(&self, inner: &mut Inner, plan: Plan) -> CommandTicket {
        let batch = self.scheduler.next_batch();
        let mut commands = Vec::with_capacity(plan.frames.len());
        for outgoing in plan.frames {
            let id = self.scheduler.enqueue(batch, outgoing.frame, outgoing.kind);
            if let Some(pixels) = outgoing.pixels {
                inner.in_transit.insert(id, pixels);
            }
            commands.push(id);
        }
        CommandTicket { batch, commands }
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    fn plan_brightness(&self, inner: &mut Inner, plan: &mut Plan, brightness: u8) -> Result<()> {
        if self.config.brightness_strategy == BrightnessStrategy::DiySettings
            && inner.sent_brightness != Some(brightness)
        {
            plan.command(Command::DiySettings(DiySettings::brightness(brightness)))?;
            inner.sent_brightness = Some(brightness);
        }
        Ok(())
    }

    fn plan_pixels(
        &self,
        inner: &mut Inner,
        plan: &mut Plan,
        pixels: &[PixelUpdate],
        limit: WriteLimit,
    ) -> Result<()> {
        if pixels.is_empty() {
            return Ok(());
        }
        let frame_number = inner.frame_counter.next();
        plan.buffered_pixels(frame_number, pixels, inner.buffer.pixel_count(), limit)?;
        inner.state.frame_number = frame_number;
        Ok(())
    }

    /// Mode 1, the whole strip in one color, then brightness
    fn plan_static(
        &self,
        inner: &mut Inner,
        color: Color,
        brightness: u8,
        limit: WriteLimit,
    ) -> Result<Plan> {
        let mut plan = Plan::default();
        plan.command(Command::mode(DiyMode::ShowStatic))?;

        let shown = match self.config.brightness_strategy {
            BrightnessStrategy::ScalePixels => color.scaled(brightness),
            BrightnessStrategy::DiySettings => color,
        };
        let pixels = inner.buffer.fill(shown);
        self.plan_pixels(inner, &mut plan, &pixels, limit)?;
        self.plan_brightness(inner, &mut plan, brightness)?;
        Ok(plan)
    }

    /// A scene frame, or a rendered animation streamed as a dynamic picture
    fn plan_effect(&self, inner: &mut Inner, effect: &Effect, limit: WriteLimit) -> Result<Plan> {
        let mut plan = Plan::default();
        let brightness = inner.state.brightness;

        match effect.kind {
            EffectKind::Scene { scene_id } => {
                plan.command(Command::SetScene {
                    scene_id,
                    brightness: protocol::scene_brightness(brightness),
                })?;
            }
            EffectKind::Animation { .. } => {
                let pixel_count = inner.buffer.pixel_count();
                let scale = self.config.brightness_strategy == BrightnessStrategy::ScalePixels;
                let mode = |mode| Command::SetMode {
                    direction: self.config.effect_direction,
                    speed: self.config.effect_speed,
                    mode,
                };

                plan.command(mode(DiyMode::DynamicPicture))?;
                for colors in effect.render(pixel_count) {
                    let frame_number = inner.frame_counter.next();
                    let pixels: Vec<PixelUpdate> = colors
                        .into_iter()
                        .enumerate()
                        .map(|(i, c)| (i as u16, if scale { c.scaled(brightness) } else { c }))
                        .collect();

                    plan.command(Command::FrameBoundary {
                        frame_number,
                        state: FrameState::Start,
                    })?;
                    plan.animation_pixels(frame_number, &pixels, pixel_count, limit)?;
                    plan.command(Command::FrameBoundary {
                        frame_number,
                        state: FrameState::End,
                    })?;
                    inner.state.frame_number = frame_number;
                }
                plan.command(mode(DiyMode::DynamicRun))?;
                self.plan_brightness(inner, &mut plan, brightness)?;
            }
        }
        Ok(plan)
    }

    /// Queue the whole last-known state again after a reconnect
    fn restore(&self, inner: &mut Inner) {
        let plan = match self.plan_restore(inner) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Could not restore previous state: {}", e);
                self.send_log(&format!("State not restored: {}", e), MessageSeverity::Warning);
                return;
            }
        };
        let ticket = self.submit(inner, plan);
        if matches!(inner.state.mode, LightMode::Effect { .. }) {
            inner.active_effect = Some(ticket.batch);
        }
        info!(
            "Restoring {} state ({} frames)",
            inner.state.mode.name(),
            ticket.len()
        );
    }

    fn plan_restore(&self, inner: &mut Inner) -> Result<Plan> {
        let limit = self.write_limit(inner)?;
        let brightness = inner.state.brightness;
        let mode = inner.state.mode;

        match mode {
            LightMode::Off => Ok(Plan::default()),
            LightMode::Static { color } => self.plan_static(inner, color, brightness, limit),
            LightMode::Dynamic => {
                let mut plan = Plan::default();
                let full = inner.buffer.full_state();
                plan.command(Command::mode(DiyMode::ShowStatic))?;
                self.plan_pixels(inner, &mut plan, &full, limit)?;
                self.plan_brightness(inner, &mut plan, brightness)?;
                Ok(plan)
            }
            LightMode::Effect { effect_id } => match effects::find_by_id(effect_id) {
                Some(effect) => self.plan_effect(inner, effect, limit),
                None => Err(ControllerError::UnknownEffect(effect_id.to_string())),
            },
            LightMode::Music(settings) => {
                let mut plan = Plan::default();
                plan.command(Command::SetMusicMode(settings))?;
                Ok(plan)
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    fn on_scheduler_event(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Acknowledged(id) => {
                let mut inner = self.inner.lock();
                if let Some(pixels) = inner.in_transit.remove(&id) {
                    inner.buffer.acknowledge(&pixels);
                }
            }
            SchedulerEvent::Failed { id, error } => {
                self.inner.lock().in_transit.remove(&id);
                warn!("{} failed: {}", id, error);
                self.send_log(&format!("Command failed: {}", error), MessageSeverity::Error);
                self.emit(ControllerEvent::CommandFailed { id, error });
            }
            SchedulerEvent::Cancelled(id) => {
                self.inner.lock().in_transit.remove(&id);
            }
            SchedulerEvent::LinkLost => self.handle_disconnect("write reported disconnect"),
        }
    }

    fn on_notification(&self, bytes: &[u8]) {
        let frame = match protocol::parse_notification(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping notification {:02X?}: {}", bytes, e);
                self.send_log(
                    &format!("Ignored invalid notification: {}", e),
                    MessageSeverity::Warning,
                );
                return;
            }
        };
        debug!("Notification {:02X?}", bytes);

        let changed = {
            let mut inner = self.inner.lock();
            let mut changed = false;
            if frame.reported_mode() == Some(DiyMode::StaticOff) && inner.state.is_on() {
                inner.state.mode = LightMode::Off;
                inner.active_effect = None;
                changed = true;
            }
            if let Some(brightness) = frame.reported_brightness() {
                inner.sent_brightness = Some(brightness);
                if brightness > 0 && inner.state.brightness != brightness {
                    inner.state.brightness = brightness;
                    changed = true;
                }
            }
            changed.then_some(inner.state)
        };

        if let Some(state) = changed {
            self.emit(ControllerEvent::StateChanged(state));
        }
        self.emit(ControllerEvent::Notification(frame));
    }

    fn handle_disconnect(&self, reason: &str) {
        let link_task = {
            let mut inner = self.inner.lock();
            if inner.status == ConnectionStatus::Disconnected {
                return;
            }
            inner.status = ConnectionStatus::Disconnected;
            inner.handle = None;
            inner.sent_brightness = None;
            inner.active_effect = None;
            inner.in_transit.clear();
            inner.buffer.mark_stale();
            inner.link_task.take()
        };

        self.scheduler.stop();
        let flushed = self.scheduler.clear();
        if let Some(task) = link_task {
            task.abort();
        }

        info!("Disconnected ({}), {} queued frame(s) dropped", reason, flushed);
        self.send_log("Disconnected from device", MessageSeverity::Info);
        self.emit(ControllerEvent::ConnectionStatus(ConnectionStatus::Disconnected));
    }
}

/// Forwards transport events in arrival order until the link drops
async fn link_listener(shared: Weak<Shared>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Notification(bytes) => shared.on_notification(&bytes),
            TransportEvent::Disconnected => {
                shared.handle_disconnect("link lost");
                return;
            }
        }
    }
}
