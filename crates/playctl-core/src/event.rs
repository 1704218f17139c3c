//! Events delivered to registered clients.

use std::fmt;


/// Outbound event.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum Event {
    OnPrepared { uri: String },
    OnPlay,
    OnPause,
    OnPlayerEndOfTrack,
    OnPlayerPositionChanged { position_ms: i32, timestamp_ms: i64 },
    OnError { message: String },
}


impl Event {
    pub fn error( message: impl Into<String> ) -> Self {
        Event::OnError { message: message.into() }
    }


    /// Short name used in logs.
    pub fn name( &self ) -> &'static str {
        match self {
            Event::OnPrepared { .. } => "onPrepared",
            Event::OnPlay => "onPlay",
            Event::OnPause => "onPause",
            Event::OnPlayerEndOfTrack => "onPlayerEndOfTrack",
            Event::OnPlayerPositionChanged { .. } => "onPlayerPositionChanged",
            Event::OnError { .. } => "onError",
        }
    }
}


impl fmt::Display for Event {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        match self {
            Event::OnPrepared { uri } => write!( f, "{} uri={}", self.name(), uri ),
            Event::OnPlayerPositionChanged { position_ms, timestamp_ms } => {
                write!( f, "{} position={}ms timestamp={}", self.name(), position_ms, timestamp_ms )
            }
            Event::OnError { message } => write!( f, "{} message={:?}", self.name(), message ),
            _ => f.write_str( self.name() ),
        }
    }
}
