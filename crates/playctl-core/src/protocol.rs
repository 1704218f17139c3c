//! Line-delimited JSON wire format
//!
//! Every message is one JSON object per line: `{"what": <code>, "data": {...}}`.
//! Codes 1-104 travel from clients to the service, 200-205 the other way.
//! Unknown inbound codes decode to [`Request::Unknown`] so older services
//! ignore newer commands instead of failing.

use serde::de::DeserializeOwned;
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use thiserror::Error;

use crate::command::{ Command, Request };
use crate::event::Event;
use crate::player::Credential;


pub const MSG_REGISTER_CLIENT: i32 = 1;
pub const MSG_UNREGISTER_CLIENT: i32 = 2;

pub const MSG_PREPARE: i32 = 100;
pub const MSG_PLAY: i32 = 101;
pub const MSG_PAUSE: i32 = 102;
pub const MSG_SEEK: i32 = 103;
pub const MSG_SETBITRATE: i32 = 104;

pub const MSG_ONPAUSE: i32 = 200;
pub const MSG_ONPLAY: i32 = 201;
pub const MSG_ONPREPARED: i32 = 202;
pub const MSG_ONPLAYERENDOFTRACK: i32 = 203;
pub const MSG_ONPLAYERPOSITIONCHANGED: i32 = 204;
pub const MSG_ONERROR: i32 = 205;


/// Errors that can occur while decoding a wire message.
#[derive( Debug, Error )]
pub enum ProtocolError {
    #[error( "Malformed message: {0}" )]
    Malformed( #[from] serde_json::Error ),

    #[error( "Invalid arguments for message {what}: {source}" )]
    InvalidArguments {
        what: i32,
        #[source]
        source: serde_json::Error,
    },

    #[error( "Unexpected message code {0}" )]
    UnexpectedCode( i32 ),
}


/// An inbound line before its arguments are looked at.
#[derive( Debug, Deserialize )]
struct Incoming {
    what: i32,
    #[serde( default )]
    data: Value,
}


#[derive( Debug, Serialize )]
struct Outgoing<T> {
    what: i32,
    #[serde( skip_serializing_if = "Option::is_none" )]
    data: Option<T>,
}


#[derive( Debug, Serialize, Deserialize )]
#[serde( rename_all = "camelCase" )]
struct PrepareArgs {
    uri: String,
    access_token: String,
    #[serde( default, skip_serializing_if = "Option::is_none" )]
    access_token_secret: Option<String>,
    #[serde( default )]
    access_token_expires: i64,
}


#[derive( Debug, Serialize, Deserialize )]
struct SeekArgs {
    #[serde( default )]
    ms: i32,
}


#[derive( Debug, Serialize, Deserialize )]
struct BitRateArgs {
    #[serde( default )]
    mode: i32,
}


#[derive( Debug, Serialize, Deserialize )]
struct PreparedArgs {
    uri: String,
}


#[derive( Debug, Serialize, Deserialize )]
struct PositionArgs {
    position: i32,
    timestamp: i64,
}


#[derive( Debug, Serialize, Deserialize )]
struct ErrorArgs {
    message: String,
}


fn args<T: DeserializeOwned>( what: i32, data: Value ) -> Result<T, ProtocolError> {
    // Missing "data" decodes like an empty object so defaulted fields apply
    let data = if data.is_null() { Value::Object( Default::default() ) } else { data };
    serde_json::from_value( data ).map_err( |source| ProtocolError::InvalidArguments { what, source } )
}


fn encode<T: Serialize>( what: i32, data: T ) -> String {
    // Plain structs of strings and integers always serialize
    serde_json::to_string( &Outgoing { what, data: Some( data ) } ).unwrap_or_default()
}


fn encode_bare( what: i32 ) -> String {
    serde_json::to_string( &Outgoing::<()> { what, data: None } ).unwrap_or_default()
}


impl Request {
    /// Decodes one inbound line.
    pub fn decode( line: &str ) -> Result<Self, ProtocolError> {
        let Incoming { what, data } = serde_json::from_str( line )?;

        let request = match what {
            MSG_REGISTER_CLIENT => Request::RegisterClient,
            MSG_UNREGISTER_CLIENT => Request::UnregisterClient,
            MSG_PREPARE => {
                let PrepareArgs { uri, access_token, access_token_secret, access_token_expires } =
                    args( what, data )?;
                let credential = Credential {
                    access_token,
                    access_token_secret,
                    access_token_expires,
                };
                Request::Command( Command::Prepare { uri, credential } )
            }
            MSG_PLAY => Request::Command( Command::Play ),
            MSG_PAUSE => Request::Command( Command::Pause ),
            MSG_SEEK => {
                let SeekArgs { ms } = args( what, data )?;
                Request::Command( Command::Seek { position_ms: ms } )
            }
            MSG_SETBITRATE => {
                let BitRateArgs { mode } = args( what, data )?;
                Request::Command( Command::SetBitRate { mode } )
            }
            other => Request::Unknown( other ),
        };

        Ok( request )
    }


    /// Encodes the request as one line, without the trailing newline.
    pub fn encode( &self ) -> String {
        match self {
            Request::RegisterClient => encode_bare( MSG_REGISTER_CLIENT ),
            Request::UnregisterClient => encode_bare( MSG_UNREGISTER_CLIENT ),
            Request::Command( Command::Prepare { uri, credential } ) => encode( MSG_PREPARE, PrepareArgs {
                uri: uri.clone(),
                access_token: credential.access_token.clone(),
                access_token_secret: credential.access_token_secret.clone(),
                access_token_expires: credential.access_token_expires,
            }),
            Request::Command( Command::Play ) => encode_bare( MSG_PLAY ),
            Request::Command( Command::Pause ) => encode_bare( MSG_PAUSE ),
            Request::Command( Command::Seek { position_ms } ) => {
                encode( MSG_SEEK, SeekArgs { ms: *position_ms } )
            }
            Request::Command( Command::SetBitRate { mode } ) => {
                encode( MSG_SETBITRATE, BitRateArgs { mode: *mode } )
            }
            Request::Unknown( what ) => encode_bare( *what ),
        }
    }
}


impl Event {
    /// Encodes the event as one line, without the trailing newline.
    pub fn encode( &self ) -> String {
        match self {
            Event::OnPause => encode_bare( MSG_ONPAUSE ),
            Event::OnPlay => encode_bare( MSG_ONPLAY ),
            Event::OnPrepared { uri } => encode( MSG_ONPREPARED, PreparedArgs { uri: uri.clone() } ),
            Event::OnPlayerEndOfTrack => encode_bare( MSG_ONPLAYERENDOFTRACK ),
            Event::OnPlayerPositionChanged { position_ms, timestamp_ms } => encode(
                MSG_ONPLAYERPOSITIONCHANGED,
                PositionArgs { position: *position_ms, timestamp: *timestamp_ms },
            ),
            Event::OnError { message } => encode( MSG_ONERROR, ErrorArgs { message: message.clone() } ),
        }
    }


    /// Decodes one outbound line, as a client would.
    pub fn decode( line: &str ) -> Result<Self, ProtocolError> {
        let Incoming { what, data } = serde_json::from_str( line )?;

        let event = match what {
            MSG_ONPAUSE => Event::OnPause,
            MSG_ONPLAY => Event::OnPlay,
            MSG_ONPREPARED => {
                let PreparedArgs { uri } = args( what, data )?;
                Event::OnPrepared { uri }
            }
            MSG_ONPLAYERENDOFTRACK => Event::OnPlayerEndOfTrack,
            MSG_ONPLAYERPOSITIONCHANGED => {
                let PositionArgs { position, timestamp } = args( what, data )?;
                Event::OnPlayerPositionChanged { position_ms: position, timestamp_ms: timestamp }
            }
            MSG_ONERROR => {
                let ErrorArgs { message } = args( what, data )?;
                Event::OnError { message }
            }
            other => return Err( ProtocolError::UnexpectedCode( other ) ),
        };

        Ok( event )
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_decode_prepare() {
        let line = r#"{"what":100,"data":{"uri":"3135556","accessToken":"tok","accessTokenSecret":"s","accessTokenExpires":1700000000000}}"#;
        let request = Request::decode( line ).unwrap();
        assert_eq!( request, Request::Command( Command::Prepare {
            uri: "3135556".into(),
            credential: Credential::new( "tok", 1_700_000_000_000 ).with_secret( "s" ),
        }));
    }


    #[test]
    fn test_decode_prepare_without_secret() {
        let line = r#"{"what":100,"data":{"uri":"1","accessToken":"tok"}}"#;
        let request = Request::decode( line ).unwrap();
        assert_eq!( request, Request::Command( Command::Prepare {
            uri: "1".into(),
            credential: Credential::new( "tok", 0 ),
        }));
    }


    #[test]
    fn test_decode_prepare_missing_uri() {
        let line = r#"{"what":100,"data":{"accessToken":"tok"}}"#;
        let result = Request::decode( line );
        assert!( matches!( result, Err( ProtocolError::InvalidArguments { what: 100, .. } ) ) );
    }


    #[test]
    fn test_decode_seek_defaults_to_zero() {
        assert_eq!(
            Request::decode( r#"{"what":103}"# ).unwrap(),
            Request::Command( Command::Seek { position_ms: 0 } )
        );
        assert_eq!(
            Request::decode( r#"{"what":103,"data":{"ms":5000}}"# ).unwrap(),
            Request::Command( Command::Seek { position_ms: 5000 } )
        );
    }


    #[test]
    fn test_decode_unknown_code() {
        let request = Request::decode( r#"{"what":150,"data":{"anything":true}}"# ).unwrap();
        assert_eq!( request, Request::Unknown( 150 ) );
    }


    #[test]
    fn test_decode_malformed() {
        assert!( matches!( Request::decode( "not json" ), Err( ProtocolError::Malformed( _ ) ) ) );
        assert!( matches!( Request::decode( r#"{"data":{}}"# ), Err( ProtocolError::Malformed( _ ) ) ) );
    }


    #[test]
    fn test_encode_registration() {
        assert_eq!( Request::RegisterClient.encode(), r#"{"what":1}"# );
        assert_eq!( Request::UnregisterClient.encode(), r#"{"what":2}"# );
    }


    #[test]
    fn test_encode_prepare_request() {
        let request = Request::Command( Command::Prepare {
            uri: "9".into(),
            credential: Credential::new( "tok", 5 ),
        });
        assert_eq!(
            request.encode(),
            r#"{"what":100,"data":{"uri":"9","accessToken":"tok","accessTokenExpires":5}}"#
        );
    }


    #[test]
    fn test_encode_events() {
        assert_eq!( Event::OnPause.encode(), r#"{"what":200}"# );
        assert_eq!( Event::OnPlay.encode(), r#"{"what":201}"# );
        assert_eq!(
            Event::OnPrepared { uri: "track:123".into() }.encode(),
            r#"{"what":202,"data":{"uri":"track:123"}}"#
        );
        assert_eq!( Event::OnPlayerEndOfTrack.encode(), r#"{"what":203}"# );
        assert_eq!(
            Event::OnPlayerPositionChanged { position_ms: 5000, timestamp_ms: 1_700_000_000_123 }.encode(),
            r#"{"what":204,"data":{"position":5000,"timestamp":1700000000123}}"#
        );
        assert_eq!(
            Event::error( "Error while seeking" ).encode(),
            r#"{"what":205,"data":{"message":"Error while seeking"}}"#
        );
    }


    #[test]
    fn test_decode_event_rejects_command_code() {
        let result = Event::decode( r#"{"what":101}"# );
        assert!( matches!( result, Err( ProtocolError::UnexpectedCode( 101 ) ) ) );
    }
}
