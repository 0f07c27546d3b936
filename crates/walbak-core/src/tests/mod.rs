mod fullsync_net;
mod merger;
mod transfer;
