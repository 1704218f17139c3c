//! Simulated streaming player
//!
//! Stands in for a real streaming engine. Buffering and track playback are
//! modelled with one timer thread per player that moves it through the same
//! states a real engine reports, so the daemon and tests can exercise the
//! full session and broadcast path without audio.

use std::sync::atomic::{ AtomicUsize, Ordering };
use std::sync::mpsc::{ self, Receiver, RecvTimeoutError, Sender };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use std::thread;
use std::time::{ Duration, Instant };

use crate::player::{
    Credential, PlayerError, PlayerFactory, PlayerListener, PlayerState, TrackPlayer,
};
use crate::session::now_millis;


/// Timing and limits for simulated players.
#[derive( Debug, Clone, PartialEq, Eq )]
pub struct SimulationConfig {
    /// Players that may be alive at once
    pub max_players: usize,
    /// Time between `play_track` and READY
    pub buffering_delay: Duration,
    /// Length of every simulated track
    pub track_length: Duration,
}


impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_players: 1,
            buffering_delay: Duration::from_millis( 500 ),
            track_length: Duration::from_secs( 30 ),
        }
    }
}


/// Builds [`SimulatedPlayer`]s, enforcing the live-player limit.
pub struct SimulatedPlayerFactory {
    config: SimulationConfig,
    live: Arc<AtomicUsize>,
}


impl SimulatedPlayerFactory {
    pub fn new( config: SimulationConfig ) -> Self {
        Self {
            config,
            live: Arc::new( AtomicUsize::new( 0 ) ),
        }
    }


    /// Number of players created and not yet released.
    pub fn live_players( &self ) -> usize {
        self.live.load( Ordering::SeqCst )
    }
}


impl PlayerFactory for SimulatedPlayerFactory {
    fn create(
        &self,
        credential: &Credential,
        listener: PlayerListener,
    ) -> Result<Box<dyn TrackPlayer>, PlayerError> {
        if credential.access_token.is_empty() {
            return Err( PlayerError::Connect( "missing access token".into() ) );
        }
        if credential.is_expired( now_millis() ) {
            return Err( PlayerError::Connect( "access token expired".into() ) );
        }

        let max = self.config.max_players;
        self.live
            .fetch_update( Ordering::SeqCst, Ordering::SeqCst, |n| ( n < max ).then_some( n + 1 ) )
            .map_err( |_| PlayerError::TooManyPlayers )?;

        let shared = Arc::new( Mutex::new( Playback::default() ) );
        let ( timer, timer_rx ) = mpsc::channel();
        let spawned = {
            let shared = Arc::clone( &shared );
            let listener = listener.clone();
            let end_ms = self.config.track_length.as_millis() as i64;
            thread::Builder::new()
                .name( "playctl-sim-timer".into() )
                .spawn( move || run_timer( timer_rx, shared, listener, end_ms ) )
        };
        if let Err( e ) = spawned {
            self.live.fetch_sub( 1, Ordering::SeqCst );
            return Err( PlayerError::Engine( format!( "Failed to start player timer: {}", e ) ) );
        }

        tracing::debug!( "Simulated player created ({} live)", self.live_players() );

        Ok( Box::new( SimulatedPlayer {
            shared,
            listener,
            timer,
            config: self.config.clone(),
            slot: Arc::clone( &self.live ),
            released: false,
        }))
    }
}


/// Mutable playback state shared with the timer threads.
struct Playback {
    state: PlayerState,
    /// Bumped on every transition; stale timers compare against it
    generation: u64,
    /// Position at `started_at`, or the current position when not playing
    position_ms: i64,
    started_at: Option<Instant>,
}


impl Default for Playback {
    fn default() -> Self {
        Self {
            state: PlayerState::Uninitialized,
            generation: 0,
            position_ms: 0,
            started_at: None,
        }
    }
}


impl Playback {
    fn position( &self ) -> i64 {
        match self.started_at {
            Some( at ) => self.position_ms + at.elapsed().as_millis() as i64,
            None => self.position_ms,
        }
    }


    fn enter( &mut self, state: PlayerState, listener: &PlayerListener ) {
        self.state = state;
        self.generation += 1;
        listener.on_state_change( state, self.position() );
    }
}


/// Requests to a player's timer thread.
enum Timer {
    /// Move from `expect` to `to` at `deadline`, unless `generation` has
    /// moved on by then. Replaces any pending request.
    Arm {
        deadline: Instant,
        generation: u64,
        expect: PlayerState,
        to: PlayerState,
    },
    Stop,
}


/// Timer thread body: holds at most one pending transition.
fn run_timer( rx: Receiver<Timer>, shared: Arc<Mutex<Playback>>, listener: PlayerListener, end_ms: i64 ) {
    let mut pending: Option<( Instant, u64, PlayerState, PlayerState )> = None;

    loop {
        let received = match pending {
            Some( ( deadline, .. ) ) => {
                rx.recv_timeout( deadline.saturating_duration_since( Instant::now() ) )
            }
            None => rx.recv().map_err( |_| RecvTimeoutError::Disconnected ),
        };

        match received {
            Ok( Timer::Arm { deadline, generation, expect, to } ) => {
                pending = Some( ( deadline, generation, expect, to ) );
            }
            Ok( Timer::Stop ) | Err( RecvTimeoutError::Disconnected ) => break,
            Err( RecvTimeoutError::Timeout ) => {
                let Some( ( _, generation, expect, to ) ) = pending.take() else {
                    continue;
                };

                let mut playback = lock( &shared );
                if playback.generation != generation || playback.state != expect {
                    continue;
                }
                if to == PlayerState::PlaybackCompleted {
                    playback.position_ms = end_ms;
                    playback.started_at = None;
                }
                playback.enter( to, &listener );
            }
        }
    }

    tracing::trace!( "Simulated player timer stopped" );
}


/// A player whose engine is a single timer thread.
pub struct SimulatedPlayer {
    shared: Arc<Mutex<Playback>>,
    listener: PlayerListener,
    timer: Sender<Timer>,
    config: SimulationConfig,
    slot: Arc<AtomicUsize>,
    released: bool,
}


impl SimulatedPlayer {
    fn lock( &self ) -> MutexGuard<'_, Playback> {
        lock( &self.shared )
    }


    fn track_length_ms( &self ) -> i64 {
        self.config.track_length.as_millis() as i64
    }


    /// Moves to `to` after `delay` unless another transition happened first.
    fn schedule( &self, delay: Duration, expect: PlayerState, to: PlayerState ) {
        let generation = self.lock().generation;
        let request = Timer::Arm { deadline: Instant::now() + delay, generation, expect, to };
        if self.timer.send( request ).is_err() {
            tracing::warn!( "Simulated player timer is gone, {} will not be reached", to );
        }
    }


    fn start_clock( &self, playback: &mut Playback ) -> Duration {
        playback.started_at = Some( Instant::now() );
        let remaining = ( self.track_length_ms() - playback.position_ms ).max( 0 );
        Duration::from_millis( remaining as u64 )
    }
}


fn lock( shared: &Mutex<Playback> ) -> MutexGuard<'_, Playback> {
    shared.lock().unwrap_or_else( PoisonError::into_inner )
}


impl TrackPlayer for SimulatedPlayer {
    fn play_track( &mut self, track_id: &str ) -> Result<(), PlayerError> {
        if self.released {
            return Err( PlayerError::InvalidState( PlayerState::Released ) );
        }

        let valid = track_id.parse::<u64>().map( |id| id > 0 ).unwrap_or( false );
        if !valid {
            let message = format!( "Invalid track id: {}", track_id );
            self.listener.on_player_error( message.clone(), 0 );
            return Err( PlayerError::Engine( message ) );
        }

        tracing::info!( "Simulated player loading track {}", track_id );
        {
            let mut playback = self.lock();
            playback.position_ms = 0;
            playback.started_at = None;
            playback.enter( PlayerState::WaitingForData, &self.listener );
        }
        self.schedule( self.config.buffering_delay, PlayerState::WaitingForData, PlayerState::Ready );
        Ok(())
    }


    fn play( &mut self ) -> Result<(), PlayerError> {
        let remaining = {
            let mut playback = self.lock();
            match playback.state {
                PlayerState::Started => return Ok(()),
                PlayerState::Ready | PlayerState::Paused => {}
                PlayerState::PlaybackCompleted => playback.position_ms = 0,
                other => return Err( PlayerError::InvalidState( other ) ),
            }
            let remaining = self.start_clock( &mut playback );
            playback.enter( PlayerState::Started, &self.listener );
            remaining
        };

        self.schedule( remaining, PlayerState::Started, PlayerState::PlaybackCompleted );
        Ok(())
    }


    fn pause( &mut self ) -> Result<(), PlayerError> {
        let mut playback = self.lock();
        match playback.state {
            PlayerState::Paused => Ok(()),
            PlayerState::Started => {
                playback.position_ms = playback.position().min( self.track_length_ms() );
                playback.started_at = None;
                playback.enter( PlayerState::Paused, &self.listener );
                Ok(())
            }
            other => Err( PlayerError::InvalidState( other ) ),
        }
    }


    fn seek( &mut self, position_ms: i32 ) -> Result<(), PlayerError> {
        if position_ms < 0 {
            return Err( PlayerError::Engine( format!( "Negative seek position: {}", position_ms ) ) );
        }

        let remaining = {
            let mut playback = self.lock();
            match playback.state {
                PlayerState::Uninitialized | PlayerState::WaitingForData | PlayerState::Released => {
                    return Err( PlayerError::InvalidState( playback.state ) );
                }
                _ => {}
            }

            playback.position_ms = i64::from( position_ms ).min( self.track_length_ms() );
            if playback.state != PlayerState::Started {
                return Ok(());
            }

            // Restart the end-of-track timer from the new position
            playback.generation += 1;
            self.start_clock( &mut playback )
        };

        self.schedule( remaining, PlayerState::Started, PlayerState::PlaybackCompleted );
        Ok(())
    }


    fn release( &mut self ) {
        if self.released {
            return;
        }
        self.released = true;

        {
            let mut playback = self.lock();
            playback.position_ms = playback.position();
            playback.started_at = None;
            playback.enter( PlayerState::Released, &self.listener );
        }

        let _ = self.timer.send( Timer::Stop );
        self.slot.fetch_sub( 1, Ordering::SeqCst );
        tracing::debug!( "Simulated player released" );
    }


    fn state( &self ) -> PlayerState {
        self.lock().state
    }
}


impl Drop for SimulatedPlayer {
    fn drop( &mut self ) {
        self.release();
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::player::PlayerNotification;
    use crate::testing::{ listener, next_notification };

    const WAIT: Duration = Duration::from_secs( 2 );


    fn config( buffering_ms: u64, track_ms: u64 ) -> SimulationConfig {
        SimulationConfig {
            max_players: 1,
            buffering_delay: Duration::from_millis( buffering_ms ),
            track_length: Duration::from_millis( track_ms ),
        }
    }


    fn credential() -> Credential {
        Credential::new( "token", 0 )
    }


    fn state_of( notification: Option<PlayerNotification> ) -> Option<PlayerState> {
        match notification {
            Some( PlayerNotification::StateChanged { state, .. } ) => Some( state ),
            _ => None,
        }
    }


    #[test]
    fn test_too_many_players() {
        let factory = SimulatedPlayerFactory::new( config( 10, 1_000 ) );
        let ( l, _rx ) = listener();

        let mut first = factory.create( &credential(), l.clone() ).unwrap();
        assert!( matches!( factory.create( &credential(), l.clone() ), Err( PlayerError::TooManyPlayers ) ) );

        first.release();
        assert_eq!( factory.live_players(), 0 );
        assert!( factory.create( &credential(), l ).is_ok() );
    }


    #[test]
    fn test_rejects_bad_credentials() {
        let factory = SimulatedPlayerFactory::new( config( 10, 1_000 ) );
        let ( l, _rx ) = listener();

        let expired = Credential::new( "token", 1 );
        assert!( matches!( factory.create( &expired, l.clone() ), Err( PlayerError::Connect( _ ) ) ) );

        let empty = Credential::new( "", 0 );
        assert!( matches!( factory.create( &empty, l ), Err( PlayerError::Connect( _ ) ) ) );
        assert_eq!( factory.live_players(), 0 );
    }


    #[test]
    fn test_buffering_then_ready() {
        let factory = SimulatedPlayerFactory::new( config( 10, 1_000 ) );
        let ( l, rx ) = listener();
        let mut player = factory.create( &credential(), l ).unwrap();

        player.play_track( "3135556" ).unwrap();
        assert_eq!( state_of( next_notification( &rx, WAIT ) ), Some( PlayerState::WaitingForData ) );
        assert_eq!( state_of( next_notification( &rx, WAIT ) ), Some( PlayerState::Ready ) );
        assert_eq!( player.state(), PlayerState::Ready );
    }


    #[test]
    fn test_play_pause_and_completion() {
        let factory = SimulatedPlayerFactory::new( config( 5, 50 ) );
        let ( l, rx ) = listener();
        let mut player = factory.create( &credential(), l ).unwrap();
        player.play_track( "1" ).unwrap();
        next_notification( &rx, WAIT );
        next_notification( &rx, WAIT );

        player.play().unwrap();
        assert_eq!( state_of( next_notification( &rx, WAIT ) ), Some( PlayerState::Started ) );
        player.pause().unwrap();
        assert_eq!( state_of( next_notification( &rx, WAIT ) ), Some( PlayerState::Paused ) );

        player.play().unwrap();
        assert_eq!( state_of( next_notification( &rx, WAIT ) ), Some( PlayerState::Started ) );
        assert_eq!( state_of( next_notification( &rx, WAIT ) ), Some( PlayerState::PlaybackCompleted ) );
    }


    #[test]
    fn test_seek_before_ready_fails() {
        let factory = SimulatedPlayerFactory::new( config( 1_000, 1_000 ) );
        let ( l, _rx ) = listener();
        let mut player = factory.create( &credential(), l ).unwrap();

        assert!( matches!( player.seek( 10 ), Err( PlayerError::InvalidState( PlayerState::Uninitialized ) ) ) );
        player.play_track( "1" ).unwrap();
        assert!( matches!( player.seek( 10 ), Err( PlayerError::InvalidState( PlayerState::WaitingForData ) ) ) );
    }


    #[test]
    fn test_invalid_track_id_reports_error() {
        let factory = SimulatedPlayerFactory::new( config( 10, 1_000 ) );
        let ( l, rx ) = listener();
        let mut player = factory.create( &credential(), l ).unwrap();

        assert!( player.play_track( "track:abc" ).is_err() );
        assert!( matches!(
            next_notification( &rx, WAIT ),
            Some( PlayerNotification::PlayerError { .. } )
        ));
        assert_eq!( player.state(), PlayerState::Uninitialized );
    }


    #[test]
    fn test_seek_burst_completes_once() {
        let factory = SimulatedPlayerFactory::new( config( 5, 60 ) );
        let ( l, rx ) = listener();
        let mut player = factory.create( &credential(), l ).unwrap();
        player.play_track( "1" ).unwrap();
        next_notification( &rx, WAIT );
        next_notification( &rx, WAIT );
        player.play().unwrap();
        assert_eq!( state_of( next_notification( &rx, WAIT ) ), Some( PlayerState::Started ) );

        for _ in 0..50 {
            player.seek( 0 ).unwrap();
        }
        player.seek( 50 ).unwrap();

        assert_eq!( state_of( next_notification( &rx, WAIT ) ), Some( PlayerState::PlaybackCompleted ) );
        assert!( next_notification( &rx, Duration::from_millis( 150 ) ).is_none() );
    }


    #[test]
    fn test_release_cancels_pending_completion() {
        let factory = SimulatedPlayerFactory::new( config( 5, 50 ) );
        let ( l, rx ) = listener();
        let mut player = factory.create( &credential(), l ).unwrap();
        player.play_track( "1" ).unwrap();
        next_notification( &rx, WAIT );
        next_notification( &rx, WAIT );
        player.play().unwrap();
        next_notification( &rx, WAIT );

        player.release();
        assert_eq!( state_of( next_notification( &rx, WAIT ) ), Some( PlayerState::Released ) );
        assert!( next_notification( &rx, Duration::from_millis( 150 ) ).is_none() );
    }


    #[test]
    fn test_release_is_idempotent() {
        let factory = SimulatedPlayerFactory::new( config( 10, 1_000 ) );
        let ( l, rx ) = listener();
        let mut player = factory.create( &credential(), l ).unwrap();

        player.release();
        player.release();
        drop( player );

        assert_eq!( factory.live_players(), 0 );
        assert_eq!( state_of( next_notification( &rx, WAIT ) ), Some( PlayerState::Released ) );
        assert!( next_notification( &rx, Duration::from_millis( 20 ) ).is_none() );
    }
}
