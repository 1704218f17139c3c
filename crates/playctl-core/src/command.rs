//! Commands and request parsing
//!
//! Defines the playback commands the dispatcher routes to the session, the
//! requests a client can make, and the text form the `playctl send` client
//! accepts.

use thiserror::Error;

use crate::broadcast::Client;
use crate::player::Credential;


/// Errors that can occur during command parsing.
#[derive( Debug, Error )]
pub enum CommandError {
    #[error( "Unknown command: {0}" )]
    Unknown( String ),

    #[error( "Invalid argument: {0}" )]
    InvalidArgument( String ),

    #[error( "Missing argument: {0}" )]
    MissingArgument( String ),
}


/// Playback command routed to the session.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum Command {
    Prepare { uri: String, credential: Credential },
    Play,
    Pause,
    Seek { position_ms: i32 },
    SetBitRate { mode: i32 },
}


/// What a client asks of the service, before its channel is attached.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum Request {
    RegisterClient,
    UnregisterClient,
    Command( Command ),
    /// A message code this build does not know
    Unknown( i32 ),
}


/// A request bound to the channel of the client that sent it.
#[derive( Debug, Clone )]
pub enum Message {
    RegisterClient( Client ),
    UnregisterClient( Client ),
    Command( Command ),
    Unknown( i32 ),
}


impl From<Command> for Message {
    fn from( command: Command ) -> Self {
        Message::Command( command )
    }
}


impl Request {
    /// Attaches the sender's channel, which registration requests refer to.
    pub fn into_message( self, reply_to: &Client ) -> Message {
        match self {
            Request::RegisterClient => Message::RegisterClient( reply_to.clone() ),
            Request::UnregisterClient => Message::UnregisterClient( reply_to.clone() ),
            Request::Command( command ) => Message::Command( command ),
            Request::Unknown( what ) => Message::Unknown( what ),
        }
    }


    /// Parses a text request.
    ///
    /// @param input - e.g. `prepare 3135556 <token> 1700000000000` or `seek 1:30`
    ///
    /// @returns The parsed request or an error
    pub fn parse( input: &str ) -> Result<Self, CommandError> {
        let input = input.trim();
        let mut parts = input.split_whitespace();
        let cmd = parts.next().unwrap_or( "" ).to_lowercase();

        let request = match cmd.as_str() {
            "register" | "reg" => Request::RegisterClient,
            "unregister" | "unreg" => Request::UnregisterClient,
            "prepare" | "prep" | "load" => {
                let uri = parts.next()
                    .ok_or_else( || CommandError::MissingArgument( "uri".into() ) )?;
                let token = parts.next()
                    .ok_or_else( || CommandError::MissingArgument( "access token".into() ) )?;
                let expires = parts.next()
                    .map( |s| s.parse::<i64>().map_err( |_| {
                        CommandError::InvalidArgument( format!( "Invalid expiry: {}", s ) )
                    }))
                    .transpose()?
                    .unwrap_or( 0 );

                let mut credential = Credential::new( token, expires );
                if let Some( secret ) = parts.next() {
                    credential = credential.with_secret( secret );
                }
                Request::Command( Command::Prepare { uri: uri.to_string(), credential } )
            }
            "play" | "p" => Request::Command( Command::Play ),
            "pause" | "pa" => Request::Command( Command::Pause ),
            "seek" | "sk" => {
                let time = parts.next()
                    .ok_or_else( || CommandError::MissingArgument( "position".into() ) )?;
                Request::Command( Command::Seek { position_ms: parse_position( time )? } )
            }
            "bitrate" | "br" => {
                let mode = parts.next()
                    .ok_or_else( || CommandError::MissingArgument( "mode".into() ) )?;
                let mode = mode.parse()
                    .map_err( |_| CommandError::InvalidArgument( format!( "Invalid mode: {}", mode ) ) )?;
                Request::Command( Command::SetBitRate { mode } )
            }

            "" => return Err( CommandError::Unknown( "empty command".into() ) ),
            other => return Err( CommandError::Unknown( other.to_string() ) ),
        };

        Ok( request )
    }
}


impl Command {
    /// Returns a brief description of the command for logs and help text.
    pub fn description( &self ) -> &'static str {
        match self {
            Command::Prepare { .. } => "Load a track",
            Command::Play => "Start or resume playback",
            Command::Pause => "Pause playback",
            Command::Seek { .. } => "Seek to position",
            Command::SetBitRate { .. } => "Select streaming bitrate",
        }
    }
}


/// Parses a position like "1:30" or "90000" into milliseconds.
///
/// @param s - Either "M:SS" or a plain number of milliseconds
///
/// @returns Milliseconds or error
fn parse_position( s: &str ) -> Result<i32, CommandError> {
    let s = s.trim();

    let millis: i64 = if let Some(( min, sec )) = s.split_once( ':' ) {
        let minutes: i64 = min.parse()
            .map_err( |_| CommandError::InvalidArgument( format!( "Invalid minutes: {}", min ) ) )?;
        let seconds: i64 = sec.parse()
            .map_err( |_| CommandError::InvalidArgument( format!( "Invalid seconds: {}", sec ) ) )?;
        ( minutes * 60 + seconds ) * 1000
    } else {
        s.parse()
            .map_err( |_| CommandError::InvalidArgument( format!( "Invalid position: {}", s ) ) )?
    };

    i32::try_from( millis )
        .ok()
        .filter( |ms| *ms >= 0 )
        .ok_or_else( || CommandError::InvalidArgument( format!( "Position out of range: {}", s ) ) )
}


/// Returns help text listing all text commands.
pub fn help_text() -> &'static str {
    r#"Session Commands:
  register                              Receive events on this connection
  unregister                            Stop receiving events

Playback Commands:
  prepare <uri> <token> [expires] [secret]
                                        Load a track
  play                                  Start or resume playback
  pause                                 Pause playback
  seek <ms|m:ss>                        Seek to position (e.g., 1:30)
  bitrate <mode>                        Select streaming bitrate"#
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_prepare() {
        let request = Request::parse( "prepare 3135556 tok 1700000000000" ).unwrap();
        assert_eq!( request, Request::Command( Command::Prepare {
            uri: "3135556".into(),
            credential: Credential::new( "tok", 1_700_000_000_000 ),
        }));
    }


    #[test]
    fn test_parse_prepare_with_secret() {
        let request = Request::parse( "load 42 tok 0 shh" ).unwrap();
        assert_eq!( request, Request::Command( Command::Prepare {
            uri: "42".into(),
            credential: Credential::new( "tok", 0 ).with_secret( "shh" ),
        }));
    }


    #[test]
    fn test_parse_prepare_missing_token() {
        let result = Request::parse( "prepare 42" );
        assert!( matches!( result, Err( CommandError::MissingArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_seek() {
        let request = Request::parse( "seek 1:30" ).unwrap();
        assert_eq!( request, Request::Command( Command::Seek { position_ms: 90_000 } ) );
    }


    #[test]
    fn test_parse_seek_millis() {
        let request = Request::parse( "sk 5000" ).unwrap();
        assert_eq!( request, Request::Command( Command::Seek { position_ms: 5000 } ) );
    }


    #[test]
    fn test_parse_seek_out_of_range() {
        let result = Request::parse( "seek 99999999999" );
        assert!( matches!( result, Err( CommandError::InvalidArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_bitrate() {
        let request = Request::parse( "bitrate 2" ).unwrap();
        assert_eq!( request, Request::Command( Command::SetBitRate { mode: 2 } ) );
    }


    #[test]
    fn test_parse_registration() {
        assert_eq!( Request::parse( "register" ).unwrap(), Request::RegisterClient );
        assert_eq!( Request::parse( "UNREG" ).unwrap(), Request::UnregisterClient );
    }


    #[test]
    fn test_parse_unknown() {
        let result = Request::parse( "foobar" );
        assert!( matches!( result, Err( CommandError::Unknown( _ ) ) ) );
    }


    #[test]
    fn test_parse_empty() {
        let result = Request::parse( "   " );
        assert!( matches!( result, Err( CommandError::Unknown( _ ) ) ) );
    }
}
