//! erp-hsm: everything that talks to the HSM
//!
//! ```text
//! HsmClient (mock | vendor)
//!   └── HsmFactory ── HsmSession (one connection, TEE token, retry-once guard)
//!         ├── HsmPool (bounded, RAII loans, keep-alive) ── Seeder
//!         └── TeeTokenUpdater (timer task, watch channel)
//! KeyDerivation = HsmPool + BlobCache
//! ```

pub mod client;
pub mod factory;
pub mod key_derivation;
pub mod mock;
pub mod pool;
pub mod remover;
pub mod seeder;
pub mod session;
pub mod token;

pub use client::{HsmClient, RawSession, MAX_RANDOM_BYTES};
pub use factory::{create_factory, ClientHsmFactory, HsmFactory};
pub use key_derivation::{
    DerivationCategory, DerivationSecret, HashedIdentifier, IdentifierKind, KeyDerivation,
};
pub use mock::MockHsmClient;
pub use pool::{HsmPool, PoolConfig, PooledSession};
pub use remover::SessionRemover;
pub use seeder::{RandomSource, Seeder};
pub use session::{DerivedKey, HsmSession};
pub use token::{Attestor, HsmTeeTokenSource, MockAttestor, TeeTokenSource, TeeTokenUpdater};
