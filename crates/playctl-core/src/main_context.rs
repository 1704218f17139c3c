//! The main context
//!
//! A single thread onto which player notifications are marshalled before they
//! touch session state or the broadcaster. Player engines call back from their
//! own threads; the listener only posts tasks here.

use std::io;
use std::sync::mpsc::{ self, Receiver, Sender };
use std::sync::Weak;
use std::thread::{ self, JoinHandle };

use crate::player::PlayerNotification;
use crate::session::SessionManager;


pub(crate) type TaskSender = Sender<Task>;


/// Work posted to the main context.
pub(crate) enum Task {
    Notification( PlayerNotification ),
    /// Acknowledged once every task posted before it has run
    Flush( Sender<()> ),
    Shutdown,
}


/// Handle to the running main-context thread.
pub(crate) struct MainContext {
    tx: TaskSender,
    thread: Option<JoinHandle<()>>,
}


impl MainContext {
    /// Creates the task channel. The thread is started separately so the
    /// session can be built with a sender first.
    pub fn channel() -> ( TaskSender, Receiver<Task> ) {
        mpsc::channel()
    }


    /// Starts the main-context thread.
    pub fn spawn(
        tx: TaskSender,
        rx: Receiver<Task>,
        session: Weak<SessionManager>,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name( "playctl-main".into() )
            .spawn( move || Self::run( rx, session ) )?;

        Ok( Self { tx, thread: Some( thread ) } )
    }


    fn run( rx: Receiver<Task>, session: Weak<SessionManager> ) {
        tracing::debug!( "Main context: started" );

        for task in rx {
            match task {
                Task::Notification( notification ) => match session.upgrade() {
                    Some( session ) => session.handle_notification( notification ),
                    None => {
                        tracing::debug!( "Main context: session gone, exiting" );
                        break;
                    }
                },
                Task::Flush( ack ) => {
                    let _ = ack.send( () );
                }
                Task::Shutdown => break,
            }
        }

        tracing::debug!( "Main context: exiting" );
    }


    /// Blocks until every task posted so far has been handled.
    ///
    /// Returns immediately once the thread has stopped.
    pub fn flush( &self ) {
        let ( ack_tx, ack_rx ) = mpsc::channel();
        if self.tx.send( Task::Flush( ack_tx ) ).is_ok() {
            let _ = ack_rx.recv();
        }
    }


    /// Stops the thread after draining the tasks already queued. Idempotent.
    pub fn stop( &mut self ) {
        let _ = self.tx.send( Task::Shutdown );
        if let Some( thread ) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!( "Main context thread panicked" );
            }
        }
    }
}


impl Drop for MainContext {
    fn drop( &mut self ) {
        self.stop();
    }
}
