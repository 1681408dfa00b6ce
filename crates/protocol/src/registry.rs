//! Static registry of the fronted RPC surface.
//!
//! Built once at startup; no runtime reflection. Each entry maps a full
//! method path to its scope, operation type, and the field-number path used
//! to locate the addressed repository (or storage name) within the request.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Addresses a whole storage; the request carries a storage name.
    Storage,
    /// Addresses a repository; the request embeds a `vault.Repository`.
    Repository,
    /// Handled by the proxy itself and never forwarded.
    ServerIntercepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Accessor,
    Mutator,
    Maintenance,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub full_method: &'static str,
    pub scope: Scope,
    pub operation: Operation,
    /// Field path of the target `vault.Repository` within the request.
    pub target_repo: Option<&'static [u32]>,
    /// Field path of a second repository (e.g. the fork source).
    pub additional_repo: Option<&'static [u32]>,
    /// Field path of the storage name for storage-scoped requests.
    pub storage_field: Option<&'static [u32]>,
}

impl MethodInfo {
    pub fn is_intercepted(&self) -> bool {
        self.scope == Scope::ServerIntercepted
    }

    /// Field path to rewrite with the routed physical storage name.
    pub fn storage_rewrite_path(&self) -> Option<Vec<u32>> {
        match self.scope {
            Scope::Repository => self.target_repo.map(|path| {
                let mut path = path.to_vec();
                path.push(crate::REPOSITORY_STORAGE_FIELD);
                path
            }),
            Scope::Storage => self.storage_field.map(|path| path.to_vec()),
            Scope::ServerIntercepted => None,
        }
    }

    /// Field path of the second repository's storage name, for two-repo
    /// RPCs. Rewritten alongside [MethodInfo::storage_rewrite_path].
    pub fn additional_rewrite_path(&self) -> Option<Vec<u32>> {
        self.additional_repo.map(|path| {
            let mut path = path.to_vec();
            path.push(crate::REPOSITORY_STORAGE_FIELD);
            path
        })
    }
}

pub struct Registry {
    methods: HashMap<&'static str, MethodInfo>,
}

macro_rules! method {
    ($table:expr, $name:expr, $scope:expr, $op:expr) => {
        method!($table, $name, $scope, $op, None, None, None)
    };
    ($table:expr, $name:expr, $scope:expr, $op:expr, target = $target:expr) => {
        method!($table, $name, $scope, $op, Some($target), None, None)
    };
    ($table:expr, $name:expr, $scope:expr, $op:expr, target = $target:expr, additional = $extra:expr) => {
        method!($table, $name, $scope, $op, Some($target), Some($extra), None)
    };
    ($table:expr, $name:expr, $scope:expr, $op:expr, storage = $storage:expr) => {
        method!($table, $name, $scope, $op, None, None, Some($storage))
    };
    ($table:expr, $name:expr, $scope:expr, $op:expr, $target:expr, $extra:expr, $storage:expr) => {
        assert!(
            $table
                .insert(
                    $name,
                    MethodInfo {
                        full_method: $name,
                        scope: $scope,
                        operation: $op,
                        target_repo: $target,
                        additional_repo: $extra,
                        storage_field: $storage,
                    },
                )
                .is_none(),
            "duplicate registry entry",
        );
    };
}

impl Registry {
    pub fn new() -> Self {
        use Operation::*;
        use Scope::*;

        let mut t = HashMap::new();

        // Repository lifecycle.
        method!(t, "/vault.RepositoryService/CreateRepository", Repository, Mutator, target = &[1]);
        method!(t, "/vault.RepositoryService/CreateFork", Repository, Mutator, target = &[1], additional = &[2]);
        method!(t, "/vault.RepositoryService/RemoveRepository", Repository, Mutator, target = &[1]);
        method!(t, "/vault.RepositoryService/RenameRepository", Repository, Mutator, target = &[1]);
        method!(t, "/vault.RepositoryService/RepositoryExists", Repository, Accessor, target = &[1]);
        method!(t, "/vault.RepositoryService/RepositorySize", Repository, Accessor, target = &[1]);

        // References and objects.
        method!(t, "/vault.RefService/ListRefs", Repository, Accessor, target = &[1]);
        method!(t, "/vault.RefService/FindRef", Repository, Accessor, target = &[1]);
        method!(t, "/vault.RefService/UpdateReferences", Repository, Mutator, target = &[1]);
        method!(t, "/vault.ObjectService/ReadObjects", Repository, Accessor, target = &[1]);
        method!(t, "/vault.ObjectService/WriteObjects", Repository, Mutator, target = &[1]);
        method!(t, "/vault.ObjectService/ReceivePack", Repository, Mutator, target = &[1]);
        method!(t, "/vault.ObjectService/UploadPack", Repository, Accessor, target = &[1]);

        // Housekeeping, replicated to every assigned storage.
        method!(t, "/vault.RepositoryService/GarbageCollect", Repository, Maintenance, target = &[1]);
        method!(t, "/vault.RepositoryService/RepackFull", Repository, Maintenance, target = &[1]);
        method!(t, "/vault.RepositoryService/RepackIncremental", Repository, Maintenance, target = &[1]);
        method!(t, "/vault.RepositoryService/Cleanup", Repository, Maintenance, target = &[1]);
        method!(t, "/vault.RepositoryService/PackRefs", Repository, Maintenance, target = &[1]);
        method!(t, "/vault.RepositoryService/WriteCommitGraph", Repository, Maintenance, target = &[1]);
        method!(t, "/vault.RepositoryService/MidxRepack", Repository, Maintenance, target = &[1]);
        method!(t, "/vault.RepositoryService/OptimizeRepository", Repository, Maintenance, target = &[1]);

        // Storage-scoped surface.
        method!(t, "/vault.ServerService/ServerInfo", Storage, Accessor, storage = &[1]);
        method!(t, "/vault.ServerService/DiskStatistics", Storage, Accessor, storage = &[1]);
        method!(t, "/vault.StorageService/ListRepositories", Storage, Accessor, storage = &[1]);

        // Handled by the proxy without forwarding.
        method!(t, proto::palisade::VOTE_TRANSACTION_METHOD, ServerIntercepted, Mutator);
        method!(t, proto::palisade::STOP_TRANSACTION_METHOD, ServerIntercepted, Mutator);
        method!(t, proto::palisade::REPOSITORY_METADATA_METHOD, ServerIntercepted, Accessor);
        method!(t, proto::palisade::DATALOSS_CHECK_METHOD, ServerIntercepted, Accessor);
        method!(t, proto::palisade::SET_AUTHORITATIVE_STORAGE_METHOD, ServerIntercepted, Mutator);
        method!(t, proto::palisade::SET_REPLICATION_FACTOR_METHOD, ServerIntercepted, Mutator);
        method!(t, proto::palisade::REPOSITORY_REPLICAS_METHOD, ServerIntercepted, Accessor);

        Self { methods: t }
    }

    pub fn lookup(&self, full_method: &str) -> Option<&MethodInfo> {
        self.methods.get(full_method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodInfo> {
        self.methods.values()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn looks_up_known_methods() {
        let registry = Registry::new();

        let info = registry
            .lookup("/vault.RepositoryService/RemoveRepository")
            .unwrap();
        assert_eq!(info.scope, Scope::Repository);
        assert_eq!(info.operation, Operation::Mutator);
        assert_eq!(info.target_repo, Some(&[1u32][..]));
        assert_eq!(info.storage_rewrite_path(), Some(vec![1, 1]));

        assert!(registry.lookup("/vault.RepositoryService/Nope").is_none());
    }

    #[test]
    fn intercepted_methods_are_marked() {
        let registry = Registry::new();
        let info = registry
            .lookup(proto::palisade::DATALOSS_CHECK_METHOD)
            .unwrap();
        assert!(info.is_intercepted());
        assert_eq!(info.storage_rewrite_path(), None);
    }

    #[test]
    fn fork_carries_an_additional_repository() {
        let registry = Registry::new();
        let info = registry
            .lookup("/vault.RepositoryService/CreateFork")
            .unwrap();
        assert_eq!(info.additional_repo, Some(&[2u32][..]));
        assert_eq!(info.additional_rewrite_path(), Some(vec![2, 1]));

        let single = registry
            .lookup("/vault.RepositoryService/CreateRepository")
            .unwrap();
        assert_eq!(single.additional_rewrite_path(), None);
    }

    #[test]
    fn storage_scoped_methods_rewrite_the_storage_field() {
        let registry = Registry::new();
        let info = registry.lookup("/vault.ServerService/ServerInfo").unwrap();
        assert_eq!(info.scope, Scope::Storage);
        assert_eq!(info.storage_rewrite_path(), Some(vec![1]));
    }
}
