//! Client registry and event fan-out
//!
//! Clients are identified by their delivery channel. A client whose delivery
//! fails is considered gone and is dropped from the registry during the same
//! fan-out.

use std::fmt;
use std::sync::{ mpsc, Arc, Mutex, MutexGuard, PoisonError };

use thiserror::Error;

use crate::event::Event;


/// Failure to hand an event to a client.
#[derive( Debug, Clone, PartialEq, Eq, Error )]
pub enum DeliveryError {
    #[error( "Client disconnected" )]
    Disconnected,

    #[error( "Delivery failed: {0}" )]
    Failed( String ),
}


/// Receiving end of a client's callback channel.
///
/// Implementations must not block: a slow client may not hold up the others.
pub trait EventSink: Send + Sync {
    fn deliver( &self, event: &Event ) -> Result<(), DeliveryError>;
}


impl EventSink for mpsc::Sender<Event> {
    fn deliver( &self, event: &Event ) -> Result<(), DeliveryError> {
        self.send( event.clone() ).map_err( |_| DeliveryError::Disconnected )
    }
}


impl EventSink for tokio::sync::mpsc::UnboundedSender<Event> {
    fn deliver( &self, event: &Event ) -> Result<(), DeliveryError> {
        self.send( event.clone() ).map_err( |_| DeliveryError::Disconnected )
    }
}


/// Handle to a client's callback channel.
///
/// Clones refer to the same client. Equality is channel identity.
#[derive( Clone )]
pub struct Client {
    sink: Arc<dyn EventSink>,
}


impl Client {
    pub fn new( sink: impl EventSink + 'static ) -> Self {
        Self { sink: Arc::new( sink ) }
    }


    /// Wraps an already shared sink, keeping its identity.
    pub fn from_arc( sink: Arc<dyn EventSink> ) -> Self {
        Self { sink }
    }


    pub fn deliver( &self, event: &Event ) -> Result<(), DeliveryError> {
        self.sink.deliver( event )
    }


    fn addr( &self ) -> *const () {
        Arc::as_ptr( &self.sink ).cast::<()>()
    }
}


impl PartialEq for Client {
    fn eq( &self, other: &Self ) -> bool {
        self.addr() == other.addr()
    }
}


impl Eq for Client {}


impl fmt::Debug for Client {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        write!( f, "Client({:p})", self.addr() )
    }
}


/// Registered clients and the fan-out over them.
#[derive( Default )]
pub struct Broadcaster {
    clients: Mutex<Vec<Client>>,
}


impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }


    fn clients( &self ) -> MutexGuard<'_, Vec<Client>> {
        self.clients.lock().unwrap_or_else( PoisonError::into_inner )
    }


    /// Adds a client. Returns false if it was already registered.
    pub fn register( &self, client: Client ) -> bool {
        let mut clients = self.clients();
        if clients.contains( &client ) {
            tracing::debug!( "{:?} already registered", client );
            return false;
        }
        tracing::debug!( "Registered {:?}", client );
        clients.push( client );
        true
    }


    /// Removes a client. Returns false if it was not registered.
    pub fn unregister( &self, client: &Client ) -> bool {
        let mut clients = self.clients();
        let before = clients.len();
        clients.retain( |c| c != client );
        let removed = clients.len() != before;
        if removed {
            tracing::debug!( "Unregistered {:?}", client );
        }
        removed
    }


    pub fn client_count( &self ) -> usize {
        self.clients().len()
    }


    pub fn is_registered( &self, client: &Client ) -> bool {
        self.clients().contains( client )
    }


    /// Delivers `event` to every registered client, in registration order.
    ///
    /// Clients whose delivery fails are removed. The registry lock is held for
    /// the whole fan-out so concurrent broadcasts reach each client in the
    /// same order.
    ///
    /// @returns Number of clients the event was delivered to
    pub fn broadcast( &self, event: &Event ) -> usize {
        let mut clients = self.clients();
        let mut delivered = 0;

        clients.retain( |client| match client.deliver( event ) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err( e ) => {
                tracing::debug!( "Dropping {:?}: {}", client, e );
                false
            }
        });

        tracing::trace!( "Broadcast {} to {} clients", event.name(), delivered );
        delivered
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;


    #[test]
    fn test_every_client_receives_each_event_once() {
        let broadcaster = Broadcaster::new();
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        broadcaster.register( a.client() );
        broadcaster.register( b.client() );

        assert_eq!( broadcaster.broadcast( &Event::OnPlay ), 2 );
        assert_eq!( broadcaster.broadcast( &Event::OnPause ), 2 );

        assert_eq!( a.events(), vec![ Event::OnPlay, Event::OnPause ] );
        assert_eq!( b.events(), vec![ Event::OnPlay, Event::OnPause ] );
    }


    #[test]
    fn test_register_twice_is_idempotent() {
        let broadcaster = Broadcaster::new();
        let a = RecordingSink::new();

        assert!( broadcaster.register( a.client() ) );
        assert!( !broadcaster.register( a.client() ) );
        assert_eq!( broadcaster.client_count(), 1 );

        broadcaster.broadcast( &Event::OnPlay );
        assert_eq!( a.events().len(), 1 );
    }


    #[test]
    fn test_unregister_unknown_client() {
        let broadcaster = Broadcaster::new();
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        broadcaster.register( a.client() );

        assert!( !broadcaster.unregister( &b.client() ) );
        assert_eq!( broadcaster.client_count(), 1 );
    }


    #[test]
    fn test_unregistered_client_receives_nothing() {
        let broadcaster = Broadcaster::new();
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        broadcaster.register( a.client() );
        broadcaster.register( b.client() );

        assert!( broadcaster.unregister( &b.client() ) );
        broadcaster.broadcast( &Event::OnPlay );

        assert_eq!( a.events(), vec![ Event::OnPlay ] );
        assert!( b.events().is_empty() );
    }


    #[test]
    fn test_broken_client_is_pruned() {
        let broadcaster = Broadcaster::new();
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        broadcaster.register( a.client() );
        broadcaster.register( b.client() );
        b.break_channel();

        assert_eq!( broadcaster.broadcast( &Event::OnPlay ), 1 );
        assert!( !broadcaster.is_registered( &b.client() ) );

        // Even if the channel recovers, the client stays gone
        b.repair_channel();
        assert_eq!( broadcaster.broadcast( &Event::OnPause ), 1 );

        assert_eq!( a.events(), vec![ Event::OnPlay, Event::OnPause ] );
        assert!( b.events().is_empty() );
    }


    #[test]
    fn test_failure_does_not_stop_fan_out() {
        let broadcaster = Broadcaster::new();
        let first = RecordingSink::new();
        let middle = RecordingSink::new();
        let last = RecordingSink::new();
        broadcaster.register( first.client() );
        broadcaster.register( middle.client() );
        broadcaster.register( last.client() );
        first.break_channel();

        assert_eq!( broadcaster.broadcast( &Event::OnPlayerEndOfTrack ), 2 );
        assert_eq!( middle.events(), vec![ Event::OnPlayerEndOfTrack ] );
        assert_eq!( last.events(), vec![ Event::OnPlayerEndOfTrack ] );
        assert_eq!( broadcaster.client_count(), 2 );
    }


    #[test]
    fn test_dropped_receiver_counts_as_dead() {
        let broadcaster = Broadcaster::new();
        let ( tx, rx ) = mpsc::channel();
        broadcaster.register( Client::new( tx ) );
        drop( rx );

        assert_eq!( broadcaster.broadcast( &Event::OnPlay ), 0 );
        assert_eq!( broadcaster.client_count(), 0 );
    }


    #[test]
    fn test_clone_shares_identity() {
        let ( tx, _rx ) = mpsc::channel::<Event>();
        let client = Client::new( tx.clone() );
        let other = Client::new( tx );

        assert_eq!( client, client.clone() );
        assert_ne!( client, other );
    }
}
