use redb::TableDefinition;

/// Node records: "<space>/<node>" -> NodeRecord (msgpack)
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Child index: "<space>/<parent>/<name>" -> node id
pub const CHILDREN: TableDefinition<&str, &str> = TableDefinition::new("children");

/// Revisions: "<space>/<node>.REV.<mtime>" -> RevisionRecord (msgpack)
pub const REVISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("revisions");
