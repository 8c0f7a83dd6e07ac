//! Viewer sessions.
//!
//! A session ties a viewer on a stream to the SFU instance chosen for it
//! and to the viewer's quality loop. At most one session exists per
//! `(stream_id, viewer_id)`; connecting again returns the existing one.
//!
//! Connect selects a server, records the session, starts the quality loop
//! and then announces the join. Join/leave propagation failures are logged
//! and left to the periodic resync; they never fail the viewer.

use crate::errors::StreamControllerError;
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use common::deadline::Deadline;
use coordinator::Coordinator;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use quality_controller::{
    LayerSwitchDispatcher, QualityLayer, QualityLoopConfig, TransportStats, ViewerLoopHandle,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default deadline for announcing a join or leave.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_millis(250);

/// Session behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    pub selection_timeout: Duration,
    pub publish_timeout: Duration,
    pub quality: QualityLoopConfig,
    /// Layer a new viewer starts on before the first stats report.
    pub initial_layer: QualityLayer,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            selection_timeout: coordinator::coordinator::DEFAULT_SELECTION_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            quality: QualityLoopConfig::default(),
            initial_layer: QualityLayer::LOWEST,
        }
    }
}

/// A viewer's assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerSession {
    pub stream_id: String,
    pub viewer_id: String,
    pub assigned_server_id: String,
    pub connected_at: DateTime<Utc>,
}

/// A session plus its quality loop's current state.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerSessionStatus {
    pub session: ViewerSession,
    pub current_layer: QualityLayer,
    pub last_layer_change_at: Option<tokio::time::Instant>,
    pub switches_issued: u64,
    pub dropped_reports: u64,
}

type SessionKey = (String, String);

fn session_key(stream_id: &str, viewer_id: &str) -> SessionKey {
    (stream_id.to_string(), viewer_id.to_string())
}

struct SessionEntry {
    session: ViewerSession,
    quality: ViewerLoopHandle,
}

/// Sessions owned by this replica.
pub struct ViewerSessionService {
    coordinator: Arc<Coordinator>,
    dispatcher: Arc<dyn LayerSwitchDispatcher>,
    settings: SessionSettings,
    sessions: DashMap<SessionKey, SessionEntry>,
    /// Parent of every quality loop.
    cancel_token: CancellationToken,
}

impl ViewerSessionService {
    #[must_use]
    pub fn new(
        coordinator: Arc<Coordinator>,
        dispatcher: Arc<dyn LayerSwitchDispatcher>,
        settings: SessionSettings,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            dispatcher,
            settings,
            sessions: DashMap::new(),
            cancel_token,
        }
    }

    /// Assign a viewer to an SFU instance and start its quality loop.
    ///
    /// # Errors
    ///
    /// Selection errors (`NoAvailableServer`, `Timeout`) from the coordinator.
    #[instrument(skip_all, name = "sc.session.connect", fields(stream_id = %stream_id, viewer_id = %viewer_id))]
    pub async fn connect(
        &self,
        stream_id: &str,
        viewer_id: &str,
    ) -> Result<ViewerSession, StreamControllerError> {
        let start = Instant::now();
        let result = self.connect_inner(stream_id, viewer_id).await;

        let status = match &result {
            Ok(_) => "success",
            Err(e) => e.error_code(),
        };
        metrics::record_session_operation("connect", status, start.elapsed());

        result
    }

    async fn connect_inner(
        &self,
        stream_id: &str,
        viewer_id: &str,
    ) -> Result<ViewerSession, StreamControllerError> {
        if let Some(existing) = self.session(stream_id, viewer_id) {
            debug!(
                target: "sc.session",
                server_id = %existing.assigned_server_id,
                "Viewer already connected"
            );
            return Ok(existing);
        }

        let slot = self
            .coordinator
            .select_least_loaded_server(stream_id, Deadline::after(self.settings.selection_timeout))
            .await?;

        // A concurrent connect for the same viewer may have won while we were
        // selecting; dropping our slot hands the capacity back.
        let session = match self.sessions.entry(session_key(stream_id, viewer_id)) {
            Entry::Occupied(occupied) => return Ok(occupied.get().session.clone()),
            Entry::Vacant(vacant) => {
                let session = ViewerSession {
                    stream_id: stream_id.to_string(),
                    viewer_id: viewer_id.to_string(),
                    assigned_server_id: slot.server_id().to_string(),
                    connected_at: Utc::now(),
                };
                let (quality, _task) = ViewerLoopHandle::spawn(
                    stream_id.to_string(),
                    viewer_id.to_string(),
                    self.settings.initial_layer,
                    self.settings.quality,
                    Arc::clone(&self.dispatcher),
                    &self.cancel_token,
                );
                vacant.insert(SessionEntry {
                    session: session.clone(),
                    quality,
                });
                session
            }
        };
        metrics::set_active_sessions(self.sessions.len());

        if let Err(e) = self
            .coordinator
            .publish_viewer_join(
                stream_id,
                viewer_id,
                &session.assigned_server_id,
                Deadline::after(self.settings.publish_timeout),
            )
            .await
        {
            warn!(
                target: "sc.session",
                error = %e,
                server_id = %session.assigned_server_id,
                "Viewer join not propagated, connect proceeds"
            );
        }
        // The join is applied locally by now, so the slot is counted in load.
        drop(slot);

        info!(
            target: "sc.session",
            server_id = %session.assigned_server_id,
            "Viewer connected"
        );
        Ok(session)
    }

    /// End a viewer's session and stop its quality loop.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if the viewer has no session on this stream.
    #[instrument(skip_all, name = "sc.session.disconnect", fields(stream_id = %stream_id, viewer_id = %viewer_id))]
    pub async fn disconnect(
        &self,
        stream_id: &str,
        viewer_id: &str,
    ) -> Result<ViewerSession, StreamControllerError> {
        let start = Instant::now();

        let Some((_, entry)) = self.sessions.remove(&session_key(stream_id, viewer_id)) else {
            metrics::record_session_operation("disconnect", "session_not_found", start.elapsed());
            return Err(StreamControllerError::SessionNotFound {
                stream_id: stream_id.to_string(),
                viewer_id: viewer_id.to_string(),
            });
        };

        entry.quality.cancel();
        metrics::set_active_sessions(self.sessions.len());

        if let Err(e) = self
            .coordinator
            .publish_viewer_leave(
                stream_id,
                viewer_id,
                &entry.session.assigned_server_id,
                Deadline::after(self.settings.publish_timeout),
            )
            .await
        {
            warn!(
                target: "sc.session",
                error = %e,
                server_id = %entry.session.assigned_server_id,
                "Viewer leave not propagated, resync will repair"
            );
        }

        info!(
            target: "sc.session",
            server_id = %entry.session.assigned_server_id,
            watched_secs = (Utc::now() - entry.session.connected_at).num_seconds(),
            "Viewer disconnected"
        );
        metrics::record_session_operation("disconnect", "success", start.elapsed());
        Ok(entry.session)
    }

    /// Disconnect every viewer of a stream. Returns how many were connected.
    pub async fn disconnect_stream(&self, stream_id: &str) -> usize {
        let viewers: Vec<String> = self
            .sessions_for_stream(stream_id)
            .into_iter()
            .map(|session| session.viewer_id)
            .collect();

        let mut disconnected = 0;
        for viewer_id in viewers {
            // A concurrent disconnect may have removed it already
            if self.disconnect(stream_id, &viewer_id).await.is_ok() {
                disconnected += 1;
            }
        }
        disconnected
    }

    /// Hand a transport stats report to the viewer's quality loop.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound` - the viewer has no session on this stream
    /// - `Quality(MailboxFull)` - the loop is behind; the report was dropped
    /// - `Quality(LoopClosed)` - the loop has stopped
    pub fn report_stats(
        &self,
        stream_id: &str,
        viewer_id: &str,
        stats: TransportStats,
    ) -> Result<(), StreamControllerError> {
        let entry = self
            .sessions
            .get(&session_key(stream_id, viewer_id))
            .ok_or_else(|| StreamControllerError::SessionNotFound {
                stream_id: stream_id.to_string(),
                viewer_id: viewer_id.to_string(),
            })?;

        entry.quality.report_stats(stats)?;
        Ok(())
    }

    /// Session with its quality state.
    ///
    /// # Errors
    ///
    /// `SessionNotFound`, or `Quality(LoopClosed)` if the loop has stopped.
    pub async fn status(
        &self,
        stream_id: &str,
        viewer_id: &str,
    ) -> Result<ViewerSessionStatus, StreamControllerError> {
        let (session, quality) = self
            .sessions
            .get(&session_key(stream_id, viewer_id))
            .map(|entry| (entry.session.clone(), entry.quality.clone()))
            .ok_or_else(|| StreamControllerError::SessionNotFound {
                stream_id: stream_id.to_string(),
                viewer_id: viewer_id.to_string(),
            })?;

        let snapshot = quality.snapshot().await?;
        Ok(ViewerSessionStatus {
            session,
            current_layer: snapshot.current_layer,
            last_layer_change_at: snapshot.last_change_at,
            switches_issued: snapshot.switches_issued,
            dropped_reports: quality.dropped_reports(),
        })
    }

    #[must_use]
    pub fn session(&self, stream_id: &str, viewer_id: &str) -> Option<ViewerSession> {
        self.sessions
            .get(&session_key(stream_id, viewer_id))
            .map(|entry| entry.session.clone())
    }

    /// Sessions on one stream, ordered by viewer id.
    #[must_use]
    pub fn sessions_for_stream(&self, stream_id: &str) -> Vec<ViewerSession> {
        let mut sessions: Vec<ViewerSession> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().0 == stream_id)
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.viewer_id.cmp(&b.viewer_id));
        sessions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stop every quality loop. Sessions are dropped without announcing
    /// leaves; the viewers stay on their SFUs and the ledger keeps them.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
        let dropped = self.sessions.len();
        self.sessions.clear();
        metrics::set_active_sessions(0);
        info!(target: "sc.session", dropped = dropped, "Viewer sessions shut down");
    }
}

impl std::fmt::Debug for ViewerSessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerSessionService")
            .field("sessions", &self.sessions.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use quality_controller::{ChannelDispatcher, LayerSwitch, QualityError};
    use sc_test_utils::TestFleet;
    use tokio::sync::mpsc;

    fn service_with(
        coordinator: Arc<Coordinator>,
    ) -> (ViewerSessionService, mpsc::Receiver<LayerSwitch>) {
        let (dispatcher, switches) = ChannelDispatcher::channel(16);
        let service = ViewerSessionService::new(
            coordinator,
            Arc::new(dispatcher),
            SessionSettings::default(),
            CancellationToken::new(),
        );
        (service, switches)
    }

    #[tokio::test]
    async fn test_connect_assigns_least_loaded_server() {
        let coordinator = TestFleet::new()
            .with_server("sfu-a", 10)
            .with_server("sfu-b", 10)
            .build();
        let (service, _switches) = service_with(Arc::clone(&coordinator));

        let first = service.connect("s1", "v1").await.unwrap();
        let second = service.connect("s1", "v2").await.unwrap();

        assert_eq!(first.assigned_server_id, "sfu-a");
        assert_eq!(second.assigned_server_id, "sfu-b");
        assert_eq!(coordinator.viewer_count("s1"), 2);
        assert_eq!(service.len(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_returns_existing_session() {
        let coordinator = TestFleet::new()
            .with_server("sfu-a", 10)
            .with_server("sfu-b", 10)
            .build();
        let (service, _switches) = service_with(Arc::clone(&coordinator));

        let first = service.connect("s1", "v1").await.unwrap();
        let again = service.connect("s1", "v1").await.unwrap();

        assert_eq!(first, again);
        assert_eq!(coordinator.viewer_count("s1"), 1);
        let loads: u32 = coordinator.servers().iter().map(|s| s.current_load).sum();
        assert_eq!(loads, 1);
    }

    #[tokio::test]
    async fn test_concurrent_connects_keep_one_assignment() {
        let coordinator = TestFleet::new().with_server("sfu-a", 10).build();
        let (service, _switches) = service_with(Arc::clone(&coordinator));

        let (a, b) = tokio::join!(service.connect("s1", "v1"), service.connect("s1", "v1"));

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(service.len(), 1);
        assert_eq!(coordinator.viewer_count("s1"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_connects_never_overfill_server() {
        let coordinator = TestFleet::new().with_server("sfu-a", 3).build();
        let (service, _switches) = service_with(Arc::clone(&coordinator));

        let viewers: Vec<String> = (0..6).map(|i| format!("v{i}")).collect();
        let results =
            futures::future::join_all(viewers.iter().map(|viewer| service.connect("s1", viewer)))
                .await;

        let admitted = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(admitted, 3);
        assert!(results
            .iter()
            .filter_map(|result| result.as_ref().err())
            .all(|e| e.error_code() == "no_available_server"));

        let server = &coordinator.servers()[0];
        assert_eq!((server.current_load, server.reserved), (3, 0));
    }

    #[tokio::test]
    async fn test_same_viewer_on_two_streams_gets_two_sessions() {
        let coordinator = TestFleet::new().with_server("sfu-a", 10).build();
        let (service, _switches) = service_with(Arc::clone(&coordinator));

        service.connect("s1", "v1").await.unwrap();
        service.connect("s2", "v1").await.unwrap();

        assert_eq!(service.len(), 2);
        assert_eq!(service.sessions_for_stream("s1").len(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_servers_fails_fast() {
        let coordinator = TestFleet::new().build();
        let (service, _switches) = service_with(coordinator);

        let err = service.connect("s1", "v1").await.unwrap_err();

        assert_eq!(err.error_code(), "no_available_server");
        assert!(service.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_releases_load() {
        let coordinator = TestFleet::new().with_server("sfu-a", 10).build();
        let (service, _switches) = service_with(Arc::clone(&coordinator));

        service.connect("s1", "v1").await.unwrap();
        let session = service.disconnect("s1", "v1").await.unwrap();

        assert_eq!(session.assigned_server_id, "sfu-a");
        assert_eq!(coordinator.viewer_count("s1"), 0);
        assert_eq!(coordinator.servers()[0].current_load, 0);

        let err = service.disconnect("s1", "v1").await.unwrap_err();
        assert!(matches!(err, StreamControllerError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_stream_only_touches_that_stream() {
        let coordinator = TestFleet::new().with_server("sfu-a", 10).build();
        let (service, _switches) = service_with(Arc::clone(&coordinator));

        service.connect("s1", "v1").await.unwrap();
        service.connect("s1", "v2").await.unwrap();
        service.connect("s2", "v3").await.unwrap();

        assert_eq!(service.disconnect_stream("s1").await, 2);
        assert_eq!(coordinator.viewer_count("s1"), 0);
        assert_eq!(coordinator.viewer_count("s2"), 1);
        assert_eq!(service.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_drive_layer_switch() {
        let coordinator = TestFleet::new().with_server("sfu-a", 10).build();
        let (service, mut switches) = service_with(coordinator);

        service.connect("s1", "v1").await.unwrap();
        service
            .report_stats("s1", "v1", TransportStats::with_bitrate(3000.0))
            .unwrap();

        let switch = tokio::time::timeout(Duration::from_secs(1), switches.recv())
            .await
            .expect("switch dispatched")
            .expect("channel open");
        assert_eq!(switch.viewer_id, "v1");
        assert_eq!(switch.layer, QualityLayer::P1080);

        let status = service.status("s1", "v1").await.unwrap();
        assert_eq!(status.current_layer, QualityLayer::P1080);
        assert_eq!(status.switches_issued, 1);
        assert!(status.last_layer_change_at.is_some());
    }

    #[tokio::test]
    async fn test_stats_for_unknown_viewer() {
        let coordinator = TestFleet::new().with_server("sfu-a", 10).build();
        let (service, _switches) = service_with(coordinator);

        let err = service
            .report_stats("s1", "ghost", TransportStats::with_bitrate(100.0))
            .unwrap_err();
        assert!(matches!(err, StreamControllerError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_stops_quality_loops() {
        let coordinator = TestFleet::new().with_server("sfu-a", 10).build();
        let (service, _switches) = service_with(Arc::clone(&coordinator));

        service.connect("s1", "v1").await.unwrap();
        let handle = service
            .sessions
            .get(&session_key("s1", "v1"))
            .map(|entry| entry.quality.clone())
            .unwrap();

        service.shutdown();

        assert!(handle.is_cancelled());
        assert!(service.is_empty());
        // Membership is left for the ledger to carry
        assert_eq!(coordinator.viewer_count("s1"), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            handle.report_stats(TransportStats::with_bitrate(1.0)),
            Err(QualityError::LoopClosed)
        ));
    }
}
