//! Recording doubles shared by the unit tests.

use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::mpsc::Receiver;
use std::sync::{ Arc, Mutex };
use std::time::Duration;

use crate::broadcast::{ Client, DeliveryError, EventSink };
use crate::event::Event;
use crate::main_context::{ MainContext, Task };
use crate::player::{
    Credential, PlayerError, PlayerFactory, PlayerListener, PlayerNotification, PlayerState,
    TrackPlayer,
};


/// A listener whose notifications land in the returned receiver.
pub fn listener() -> ( PlayerListener, Receiver<Task> ) {
    let ( tx, rx ) = MainContext::channel();
    ( PlayerListener::new( tx ), rx )
}


/// Waits up to `timeout` for the next notification posted to `rx`.
pub fn next_notification( rx: &Receiver<Task>, timeout: Duration ) -> Option<PlayerNotification> {
    loop {
        match rx.recv_timeout( timeout ) {
            Ok( Task::Notification( n ) ) => return Some( n ),
            Ok( _ ) => continue,
            Err( _ ) => return None,
        }
    }
}


struct SinkInner {
    events: Mutex<Vec<Event>>,
    broken: AtomicBool,
}


impl EventSink for SinkInner {
    fn deliver( &self, event: &Event ) -> Result<(), DeliveryError> {
        if self.broken.load( Ordering::SeqCst ) {
            return Err( DeliveryError::Failed( "broken pipe".into() ) );
        }
        self.events.lock().unwrap().push( event.clone() );
        Ok(())
    }
}


/// Client channel that records what it receives and can be broken on demand.
#[derive( Clone )]
pub struct RecordingSink {
    inner: Arc<SinkInner>,
    client: Client,
}


impl RecordingSink {
    pub fn new() -> Self {
        let inner = Arc::new( SinkInner {
            events: Mutex::new( Vec::new() ),
            broken: AtomicBool::new( false ),
        });
        let client = Client::from_arc( inner.clone() );
        Self { inner, client }
    }


    pub fn client( &self ) -> Client {
        self.client.clone()
    }


    pub fn events( &self ) -> Vec<Event> {
        self.inner.events.lock().unwrap().clone()
    }


    pub fn break_channel( &self ) {
        self.inner.broken.store( true, Ordering::SeqCst );
    }


    pub fn repair_channel( &self ) {
        self.inner.broken.store( false, Ordering::SeqCst );
    }
}


struct MockState {
    calls: Vec<String>,
    state: PlayerState,
    seek_error: Option<PlayerError>,
}


/// Test-side view of a player created by [`MockFactory`].
#[derive( Clone )]
pub struct MockPlayerHandle {
    state: Arc<Mutex<MockState>>,
}


impl MockPlayerHandle {
    pub fn calls( &self ) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }


    pub fn set_state( &self, state: PlayerState ) {
        self.state.lock().unwrap().state = state;
    }


    pub fn fail_seek_with( &self, error: PlayerError ) {
        self.state.lock().unwrap().seek_error = Some( error );
    }


    fn record( &self, call: String ) {
        self.state.lock().unwrap().calls.push( call );
    }
}


/// Player that records calls and only changes state when told to.
struct MockPlayer {
    handle: MockPlayerHandle,
}


impl TrackPlayer for MockPlayer {
    fn play_track( &mut self, track_id: &str ) -> Result<(), PlayerError> {
        self.handle.record( format!( "play_track({})", track_id ) );
        Ok(())
    }


    fn play( &mut self ) -> Result<(), PlayerError> {
        self.handle.record( "play".into() );
        Ok(())
    }


    fn pause( &mut self ) -> Result<(), PlayerError> {
        self.handle.record( "pause".into() );
        Ok(())
    }


    fn seek( &mut self, position_ms: i32 ) -> Result<(), PlayerError> {
        self.handle.record( format!( "seek({})", position_ms ) );
        match self.handle.state.lock().unwrap().seek_error.clone() {
            Some( e ) => Err( e ),
            None => Ok(()),
        }
    }


    fn release( &mut self ) {
        let mut state = self.handle.state.lock().unwrap();
        if state.state != PlayerState::Released {
            state.calls.push( "release".into() );
            state.state = PlayerState::Released;
        }
    }


    fn state( &self ) -> PlayerState {
        self.handle.state.lock().unwrap().state
    }
}


#[derive( Default )]
struct FactoryState {
    players: Vec<MockPlayerHandle>,
    fail: Option<PlayerError>,
    last_credential: Option<Credential>,
    last_listener: Option<PlayerListener>,
}


/// Factory handing out [`MockPlayer`]s.
#[derive( Clone, Default )]
pub struct MockFactory {
    state: Arc<Mutex<FactoryState>>,
}


impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }


    pub fn created( &self ) -> usize {
        self.state.lock().unwrap().players.len()
    }


    /// The most recently created player.
    pub fn player( &self ) -> MockPlayerHandle {
        self.state.lock().unwrap().players.last().cloned().expect( "no player created" )
    }


    /// The listener handed to the most recently created player.
    pub fn listener( &self ) -> PlayerListener {
        self.state.lock().unwrap().last_listener.clone().expect( "no player created" )
    }


    pub fn last_credential( &self ) -> Option<Credential> {
        self.state.lock().unwrap().last_credential.clone()
    }


    pub fn fail_with( &self, error: PlayerError ) {
        self.state.lock().unwrap().fail = Some( error );
    }
}


impl PlayerFactory for MockFactory {
    fn create(
        &self,
        credential: &Credential,
        listener: PlayerListener,
    ) -> Result<Box<dyn TrackPlayer>, PlayerError> {
        let mut state = self.state.lock().unwrap();
        state.last_credential = Some( credential.clone() );
        if let Some( e ) = state.fail.clone() {
            return Err( e );
        }

        let handle = MockPlayerHandle {
            state: Arc::new( Mutex::new( MockState {
                calls: Vec::new(),
                state: PlayerState::Uninitialized,
                seek_error: None,
            })),
        };
        state.players.push( handle.clone() );
        state.last_listener = Some( listener );
        Ok( Box::new( MockPlayer { handle } ) )
    }
}
